//! Write-through map persisted in a single store row.
//!
//! A [`PersistentMap`] loads its row when opened and writes the whole map
//! back on every mutation before returning. Reads are served from memory and
//! never touch the store, so a long-lived instance does not see writes made
//! by other instances until it is reopened or [`reload`](PersistentMap::reload)ed.
//!
//! There is no locking between instances: two instances that load the same
//! row and then write will race, and the later write replaces the earlier one
//! in full.
//!
//! Rows are limited to DynamoDB's 400 KB item size. Larger maps are rejected
//! by the store itself with a validation error.
//!
//! Values survive a reload as JSON, not as Rust values: DynamoDB drops
//! trailing fractional zeros, so `1.0` is read back as the integer `1`, and
//! NaN or infinite floats are refused before anything is written.

use std::future::Future;
use std::sync::Arc;

use configs::{is_reserved, process_env, ExplicitConfig, PersistenceConfig, Setting};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::codec;
use crate::errors::{PersistenceError, StoreError, REQUIRED_PERMISSIONS};
use crate::observability::{record_error, STORE_READS_TOTAL, STORE_WRITES_TOTAL, TABLES_CREATED_TOTAL};
use crate::retry::{retry_with_policy, RetryPolicy};
use crate::storage::{DynamoDbRowStore, DynamoDbSettings, RowStore};

/// Environment variable lookup used for configuration overrides.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Everything [`PersistentMap::open`] needs besides the store.
#[derive(Clone)]
pub struct OpenOptions {
    /// Entries merged over the loaded row. Reserved configuration names are
    /// removed from it and used as configuration instead.
    pub initial: Map<String, Value>,
    pub explicit: ExplicitConfig,
    pub lookup: EnvLookup,
    pub retry: RetryPolicy,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            initial: Map::new(),
            explicit: ExplicitConfig::default(),
            lookup: Arc::new(process_env),
            retry: RetryPolicy::disabled(),
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self { Self::default() }

    pub fn initial(mut self, initial: Map<String, Value>) -> Self {
        self.initial = initial;
        self
    }

    pub fn entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.initial.insert(key.into(), value);
        self
    }

    pub fn explicit(mut self, explicit: ExplicitConfig) -> Self {
        self.explicit = explicit;
        self
    }

    pub fn setting(mut self, setting: Setting, value: impl Into<String>) -> Self {
        self.explicit = self.explicit.with(setting, value);
        self
    }

    pub fn lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.lookup = Arc::new(lookup);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Remote row reads and writes issued by one map instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub gets: u32,
    pub puts: u32,
}

enum Provisioned {
    Existing,
    Created,
    /// Another instance created the table between our describe and create.
    Raced,
}

pub struct PersistentMap {
    store: Arc<dyn RowStore>,
    config: PersistenceConfig,
    row_key: String,
    entries: Map<String, Value>,
    retry: RetryPolicy,
    stats: IoStats,
}

impl std::fmt::Debug for PersistentMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentMap")
            .field("config", &self.config)
            .field("entries", &self.entries)
            .finish()
    }
}

impl PersistentMap {
    /// Resolve configuration, make sure the table exists, load the row and
    /// merge `options.initial` over it.
    ///
    /// The row is written immediately if it did not exist yet or if the
    /// initial entries changed it.
    #[instrument(skip_all)]
    pub async fn open(store: Arc<dyn RowStore>, options: OpenOptions) -> Result<Self, PersistenceError> {
        let OpenOptions { mut initial, mut explicit, lookup, retry } = options;

        let stripped = explicit.absorb_reserved(&mut initial);
        if !stripped.is_empty() {
            let names: Vec<&str> = stripped.iter().map(|s| s.name()).collect();
            warn!(?names, "configuration names found in initial data were used as configuration");
        }

        let config = PersistenceConfig::resolve(&explicit, &*lookup);
        let row_key = config.table_key.clone().ok_or(PersistenceError::MissingRowKey)?;
        let mut map = Self { store, config, row_key, entries: Map::new(), retry, stats: IoStats::default() };

        let loaded = match map.ensure_store_ready().await? {
            Provisioned::Created => None,
            Provisioned::Existing | Provisioned::Raced => map.fetch_row().await?,
        };
        let row_exists = loaded.is_some();
        let loaded = loaded.unwrap_or_default();

        let mut merged = loaded.clone();
        merged.extend(initial);
        if !row_exists || merged != loaded {
            map.write(merged).await?;
        } else {
            map.entries = merged;
        }

        info!(
            table = %map.config.table_name,
            row_key = %map.row_key,
            row_exists,
            entries = map.entries.len(),
            "persistent map opened"
        );
        Ok(map)
    }

    /// Open with defaults: process environment, no initial data.
    pub async fn open_default(store: Arc<dyn RowStore>) -> Result<Self, PersistenceError> {
        Self::open(store, OpenOptions::default()).await
    }

    /// Open against DynamoDB using the default AWS configuration chain.
    pub async fn open_dynamodb(settings: DynamoDbSettings, options: OpenOptions) -> Result<Self, PersistenceError> {
        let store: Arc<dyn RowStore> = Arc::new(DynamoDbRowStore::from_env(settings).await);
        Self::open(store, options).await
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let result = retry_with_policy(&self.retry, f).await;
        match &result {
            Err(StoreError::AlreadyExists(_)) | Ok(_) => {}
            Err(e @ StoreError::PermissionDenied(_)) => {
                record_error(operation);
                warn!(
                    operation,
                    table = %self.config.table_name,
                    code = e.code(),
                    error = %e,
                    required = REQUIRED_PERMISSIONS,
                    "store call denied"
                );
            }
            Err(e) => {
                record_error(operation);
                warn!(operation, table = %self.config.table_name, code = e.code(), error = %e, "store call failed");
            }
        }
        result
    }

    async fn ensure_store_ready(&self) -> Result<Provisioned, PersistenceError> {
        let table = &self.config.table_name;
        let key_field = &self.config.key_field_name;

        if self.call("describe_store", || self.store.describe_store(table)).await? {
            return Ok(Provisioned::Existing);
        }

        match self.call("create_store", || self.store.create_store(table, key_field)).await {
            Ok(()) => {
                TABLES_CREATED_TOTAL.inc();
                info!(%table, %key_field, "created table");
                if let Err(e) = self.call("tag_store", || self.store.tag_store(table)).await {
                    warn!(%table, error = %e, "could not tag table, continuing");
                }
                Ok(Provisioned::Created)
            }
            Err(StoreError::AlreadyExists(_)) => {
                info!(%table, "table was created concurrently by another instance");
                Ok(Provisioned::Raced)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_row(&mut self) -> Result<Option<Map<String, Value>>, PersistenceError> {
        self.stats.gets += 1;
        STORE_READS_TOTAL.inc();
        let raw = self
            .call("get_row", || {
                self.store.get_row(
                    &self.config.table_name,
                    &self.config.key_field_name,
                    &self.row_key,
                    &self.config.value_field_name,
                )
            })
            .await?;
        let Some(raw) = raw else { return Ok(None) };
        let mut loaded = codec::from_store_value(&raw)?;
        let foreign: Vec<String> = loaded.keys().filter(|k| is_reserved(k)).cloned().collect();
        if !foreign.is_empty() {
            warn!(row_key = %self.row_key, ?foreign, "dropping configuration names found in stored row");
            loaded.retain(|k, _| !is_reserved(k));
        }
        Ok(Some(loaded))
    }

    /// Persist `next` and, once the store accepted it, make it the visible map.
    async fn write(&mut self, next: Map<String, Value>) -> Result<(), PersistenceError> {
        let value = codec::to_store_value(&next);
        self.stats.puts += 1;
        STORE_WRITES_TOTAL.inc();
        self.call("put_row", || {
            self.store.put_row(
                &self.config.table_name,
                &self.config.key_field_name,
                &self.row_key,
                &self.config.value_field_name,
                value.clone(),
            )
        })
        .await?;
        debug!(table = %self.config.table_name, row_key = %self.row_key, entries = next.len(), "row written");
        self.entries = next;
        Ok(())
    }

    /// Re-read the row, discarding the in-memory view.
    pub async fn reload(&mut self) -> Result<(), PersistenceError> {
        let loaded = self.fetch_row().await?;
        self.entries = loaded.unwrap_or_default();
        Ok(())
    }

    // ---- mutations: one full-row write each ----

    pub async fn insert<V: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: V,
    ) -> Result<Option<Value>, PersistenceError> {
        let key = key.into();
        ensure_not_reserved(&key)?;
        let value = codec::to_json(&value)?;
        let mut next = self.entries.clone();
        let previous = next.insert(key, value);
        self.write(next).await?;
        Ok(previous)
    }

    /// Remove a key and return its value. An absent key changes nothing and
    /// is not written.
    pub async fn remove(&mut self, key: &str) -> Result<Option<Value>, PersistenceError> {
        if !self.entries.contains_key(key) {
            return Ok(None);
        }
        let mut next = self.entries.clone();
        let removed = next.remove(key);
        self.write(next).await?;
        Ok(removed)
    }

    /// Apply several entries with a single write.
    pub async fn update<I, K, V>(&mut self, entries: I) -> Result<(), PersistenceError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Serialize,
    {
        let mut next = self.entries.clone();
        for (key, value) in entries {
            let key = key.into();
            ensure_not_reserved(&key)?;
            next.insert(key, codec::to_json(&value)?);
        }
        self.write(next).await
    }

    /// Edit the map in place with a single write. If `f` fails nothing is
    /// written and the map is unchanged.
    pub async fn update_with<F>(&mut self, f: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&mut Map<String, Value>) -> Result<(), PersistenceError>,
    {
        let mut next = self.entries.clone();
        f(&mut next)?;
        if let Some(key) = next.keys().find(|k| is_reserved(k)) {
            return Err(PersistenceError::ReservedKey(key.clone()));
        }
        self.write(next).await
    }

    pub async fn retain<F>(&mut self, mut f: F) -> Result<(), PersistenceError>
    where
        F: FnMut(&str, &Value) -> bool,
    {
        let mut next = self.entries.clone();
        next.retain(|k, v| f(k, v));
        self.write(next).await
    }

    pub async fn clear(&mut self) -> Result<(), PersistenceError> {
        self.write(Map::new()).await
    }

    // ---- reads: memory only ----

    pub fn get(&self, key: &str) -> Option<&Value> { self.entries.get(key) }

    /// Deserialize a value into `T`, e.g. a `chrono::DateTime` stored as an
    /// RFC 3339 string.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistenceError> {
        self.entries
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(Into::into)
    }

    pub fn contains_key(&self, key: &str) -> bool { self.entries.contains_key(key) }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn iter(&self) -> serde_json::map::Iter<'_> { self.entries.iter() }

    pub fn keys(&self) -> serde_json::map::Keys<'_> { self.entries.keys() }

    pub fn as_map(&self) -> &Map<String, Value> { &self.entries }

    pub fn config(&self) -> &PersistenceConfig { &self.config }

    pub fn row_key(&self) -> &str { &self.row_key }

    pub fn stats(&self) -> IoStats { self.stats }
}

impl<'a> IntoIterator for &'a PersistentMap {
    type Item = (&'a String, &'a Value);
    type IntoIter = serde_json::map::Iter<'a>;

    fn into_iter(self) -> Self::IntoIter { self.entries.iter() }
}

fn ensure_not_reserved(key: &str) -> Result<(), PersistenceError> {
    if is_reserved(key) {
        return Err(PersistenceError::ReservedKey(key.to_string()));
    }
    Ok(())
}
