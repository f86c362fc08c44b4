//! DynamoDB-backed [`RowStore`].

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ProvisionedThroughput, ScalarAttributeType, TableStatus, Tag,
};
use aws_sdk_dynamodb::Client;
use aws_smithy_types::timeout::TimeoutConfig;
use tokio::time::sleep;
use tracing::{debug, info, instrument};

use super::{description_for, RowStore, DESCRIPTION_TAG};
use crate::errors::StoreError;

/// Client overrides and table-readiness polling.
#[derive(Debug, Clone)]
pub struct DynamoDbSettings {
    /// Uses the SDK default if not specified.
    pub region: Option<String>,
    /// Endpoint override (DynamoDB Local, LocalStack).
    pub endpoint: Option<String>,
    pub operation_timeout: Option<Duration>,
    pub ready_poll_delay: Duration,
    pub ready_poll_attempts: u32,
}

impl Default for DynamoDbSettings {
    fn default() -> Self {
        Self::from(&configs::DynamoDbConfig::default())
    }
}

impl From<&configs::DynamoDbConfig> for DynamoDbSettings {
    fn from(cfg: &configs::DynamoDbConfig) -> Self {
        Self {
            region: cfg.region.clone(),
            endpoint: cfg.endpoint.clone(),
            operation_timeout: cfg.operation_timeout_ms.map(Duration::from_millis),
            ready_poll_delay: Duration::from_millis(cfg.ready_poll_delay_ms),
            ready_poll_attempts: cfg.ready_poll_attempts,
        }
    }
}

#[derive(Clone)]
pub struct DynamoDbRowStore {
    client: Client,
    ready_poll_delay: Duration,
    ready_poll_attempts: u32,
}

impl std::fmt::Debug for DynamoDbRowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoDbRowStore")
            .field("ready_poll_delay", &self.ready_poll_delay)
            .field("ready_poll_attempts", &self.ready_poll_attempts)
            .finish()
    }
}

impl DynamoDbRowStore {
    /// Build a client inheriting everything from `sdk_config` (credentials,
    /// HTTP client, SDK retry config) and apply the overrides on top.
    pub fn new(sdk_config: &aws_config::SdkConfig, settings: DynamoDbSettings) -> Self {
        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);
        if let Some(region) = settings.region.clone() {
            builder = builder.region(aws_sdk_dynamodb::config::Region::new(region));
        }
        if let Some(endpoint) = settings.endpoint.clone() {
            builder = builder.endpoint_url(endpoint);
        }
        if let Some(timeout) = settings.operation_timeout {
            builder = builder.timeout_config(TimeoutConfig::builder().operation_timeout(timeout).build());
        }
        Self::from_client(Client::from_conf(builder.build()), settings)
    }

    /// Load the default AWS configuration chain (environment, profile, IMDS).
    pub async fn from_env(settings: DynamoDbSettings) -> Self {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(&sdk_config, settings)
    }

    pub fn from_client(client: Client, settings: DynamoDbSettings) -> Self {
        Self {
            client,
            ready_poll_delay: settings.ready_poll_delay,
            ready_poll_attempts: settings.ready_poll_attempts.max(1),
        }
    }

    pub fn client(&self) -> &Client { &self.client }

    async fn table_status(&self, table_name: &str) -> Result<Option<TableStatus>, StoreError> {
        match self.client.describe_table().table_name(table_name).send().await {
            Ok(out) => Ok(out.table().and_then(|t| t.table_status()).cloned()),
            Err(e) => match classify(e) {
                StoreError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    /// Poll until the table reports `ACTIVE`.
    async fn wait_until_active(&self, table_name: &str) -> Result<(), StoreError> {
        for attempt in 0..self.ready_poll_attempts {
            if let Some(TableStatus::Active) = self.table_status(table_name).await? {
                return Ok(());
            }
            debug!(table = table_name, attempt, "waiting for table to become active");
            sleep(self.ready_poll_delay).await;
        }
        Err(StoreError::Unavailable(format!(
            "table {table_name} not active after {} polls",
            self.ready_poll_attempts
        )))
    }

    /// Delete one row. Administrative; the map never deletes rows.
    pub async fn delete_row(&self, table_name: &str, key_field: &str, row_key: &str) -> Result<(), StoreError> {
        self.client
            .delete_item()
            .table_name(table_name)
            .key(key_field, AttributeValue::S(row_key.to_string()))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Delete a table and wait until it is gone. Returns `false` if it did
    /// not exist. Administrative; used by the smoke test.
    pub async fn delete_store(&self, table_name: &str) -> Result<bool, StoreError> {
        match self.client.delete_table().table_name(table_name).send().await {
            Ok(_) => {}
            Err(e) => match classify(e) {
                StoreError::NotFound(_) => return Ok(false),
                other => return Err(other),
            },
        }
        for _ in 0..self.ready_poll_attempts {
            if self.table_status(table_name).await?.is_none() {
                info!(table = table_name, "table deleted");
                return Ok(true);
            }
            sleep(self.ready_poll_delay).await;
        }
        Err(StoreError::Unavailable(format!("table {table_name} still present after delete")))
    }
}

#[async_trait]
impl RowStore for DynamoDbRowStore {
    /// A table that another instance is still creating is reported only
    /// once it accepts reads and writes.
    async fn describe_store(&self, table_name: &str) -> Result<bool, StoreError> {
        match self.table_status(table_name).await? {
            None => Ok(false),
            Some(TableStatus::Creating) => {
                debug!(table = table_name, "table is being created elsewhere, waiting");
                self.wait_until_active(table_name).await?;
                Ok(true)
            }
            Some(_) => Ok(true),
        }
    }

    #[instrument(skip(self))]
    async fn create_store(&self, table_name: &str, key_field: &str) -> Result<(), StoreError> {
        let attribute = AttributeDefinition::builder()
            .attribute_name(key_field)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(build_error)?;
        let key_schema = KeySchemaElement::builder()
            .attribute_name(key_field)
            .key_type(KeyType::Hash)
            .build()
            .map_err(build_error)?;
        let throughput = ProvisionedThroughput::builder()
            .read_capacity_units(1)
            .write_capacity_units(1)
            .build()
            .map_err(build_error)?;

        let created = self
            .client
            .create_table()
            .table_name(table_name)
            .attribute_definitions(attribute)
            .key_schema(key_schema)
            .billing_mode(BillingMode::Provisioned)
            .provisioned_throughput(throughput)
            .send()
            .await
            .map_err(classify);

        match created {
            Ok(_) => {
                self.wait_until_active(table_name).await?;
                Ok(())
            }
            // Someone else is creating it; make sure it is usable before the
            // caller reads from it.
            Err(StoreError::AlreadyExists(msg)) => {
                self.wait_until_active(table_name).await?;
                Err(StoreError::AlreadyExists(msg))
            }
            Err(e) => Err(e),
        }
    }

    async fn tag_store(&self, table_name: &str) -> Result<(), StoreError> {
        let out = self.client.describe_table().table_name(table_name).send().await.map_err(classify)?;
        let arn = out
            .table()
            .and_then(|t| t.table_arn())
            .ok_or_else(|| StoreError::Unavailable(format!("no ARN reported for table {table_name}")))?
            .to_string();
        let tag = Tag::builder()
            .key(DESCRIPTION_TAG)
            .value(description_for(table_name))
            .build()
            .map_err(build_error)?;
        self.client.tag_resource().resource_arn(arn).tags(tag).send().await.map_err(classify)?;
        Ok(())
    }

    async fn get_row(
        &self,
        table_name: &str,
        key_field: &str,
        row_key: &str,
        value_field: &str,
    ) -> Result<Option<AttributeValue>, StoreError> {
        let out = self
            .client
            .get_item()
            .table_name(table_name)
            .key(key_field, AttributeValue::S(row_key.to_string()))
            .projection_expression("#v")
            .expression_attribute_names("#v", value_field)
            .consistent_read(true)
            .send()
            .await
            .map_err(classify)?;
        Ok(out.item().and_then(|item| item.get(value_field)).cloned())
    }

    async fn put_row(
        &self,
        table_name: &str,
        key_field: &str,
        row_key: &str,
        value_field: &str,
        value: AttributeValue,
    ) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(table_name)
            .item(key_field, AttributeValue::S(row_key.to_string()))
            .item(value_field, value)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}

fn build_error(e: aws_sdk_dynamodb::error::BuildError) -> StoreError {
    StoreError::Validation(e.to_string())
}

/// Map an SDK failure onto the store error taxonomy by its service error code.
fn classify<E, R>(err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    if matches!(err, SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)) {
        return StoreError::Unavailable(message);
    }
    match err.code() {
        Some("ResourceNotFoundException") => StoreError::NotFound(message),
        Some("ResourceInUseException") => StoreError::AlreadyExists(message),
        Some("AccessDeniedException" | "UnrecognizedClientException") => StoreError::PermissionDenied(message),
        Some(
            "ProvisionedThroughputExceededException"
            | "ThrottlingException"
            | "RequestLimitExceeded"
            | "LimitExceededException",
        ) => StoreError::Throttled(message),
        Some("ValidationException") => StoreError::Validation(message),
        _ => StoreError::Unavailable(message),
    }
}
