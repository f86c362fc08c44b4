//! Backing store abstraction for the persistent map.
//!
//! A store holds tables of rows; each row is addressed by a single string
//! partition key and carries one value attribute. The map only ever needs
//! the five primitive calls below.

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;

use crate::errors::StoreError;

pub mod dynamodb;
pub mod memory;

pub use dynamodb::{DynamoDbRowStore, DynamoDbSettings};
pub use memory::MemoryRowStore;

/// Tag attached to tables created by this crate.
pub const DESCRIPTION_TAG: &str = "Description";

pub fn description_for(table_name: &str) -> String {
    format!("This table contains persistent data for AWS Lambda functions, table {table_name} added by lambda-persistence")
}

#[async_trait]
pub trait RowStore: Send + Sync {
    /// `Ok(false)` when the table does not exist.
    async fn describe_store(&self, table_name: &str) -> Result<bool, StoreError>;

    /// Create a table keyed by `key_field` (string hash key) and wait until it
    /// is usable. Fails with [`StoreError::AlreadyExists`] if the table exists
    /// or is being created concurrently.
    async fn create_store(&self, table_name: &str, key_field: &str) -> Result<(), StoreError>;

    async fn tag_store(&self, table_name: &str) -> Result<(), StoreError>;

    /// Fetch only the value attribute of one row.
    async fn get_row(
        &self,
        table_name: &str,
        key_field: &str,
        row_key: &str,
        value_field: &str,
    ) -> Result<Option<AttributeValue>, StoreError>;

    /// Unconditionally overwrite one row.
    async fn put_row(
        &self,
        table_name: &str,
        key_field: &str,
        row_key: &str,
        value_field: &str,
        value: AttributeValue,
    ) -> Result<(), StoreError>;
}
