//! In-process stand-in for DynamoDB.
//!
//! Follows the same contract as the real table (duplicate creates fail with
//! `AlreadyExists`, key schema is validated, rows are replaced wholesale) so
//! the map can be exercised without AWS. Every call yields to the scheduler
//! once, which lets concurrently driven maps interleave the way separate
//! Lambda environments do.
//!
//! Numbers are stored the way DynamoDB keeps them (`1.0` becomes `1`). With
//! [`set_creation_polls`](MemoryRowStore::set_creation_polls) a new table
//! stays in a creating state for a number of status polls, during which row
//! reads and writes fail with `NotFound` like they do on a `CREATING` table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;

use super::{description_for, RowStore, DESCRIPTION_TAG};
use crate::codec::normalize_number;
use crate::errors::StoreError;

type Item = HashMap<String, AttributeValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Describe,
    Create,
    Tag,
    Get,
    Put,
}

/// Number of calls received per operation, failed ones included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub describe: u32,
    pub create: u32,
    pub tag: u32,
    pub get: u32,
    pub put: u32,
}

#[derive(Debug)]
struct Table {
    key_field: String,
    tags: HashMap<String, String>,
    rows: HashMap<String, Item>,
    // status polls left before the table is active
    creating: u32,
}

#[derive(Debug)]
struct Failure {
    error: StoreError,
    // None: fail until cleared
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
pub struct MemoryRowStore {
    tables: Mutex<HashMap<String, Table>>,
    calls: Mutex<CallCounts>,
    failures: Mutex<HashMap<Operation, Failure>>,
    creation_polls: Mutex<u32>,
}

impl MemoryRowStore {
    pub fn new() -> Self { Self::default() }

    pub fn shared() -> Arc<Self> { Arc::new(Self::default()) }

    /// Make every call of `op` fail with `error` until [`clear_failures`](Self::clear_failures).
    pub fn fail_on(&self, op: Operation, error: StoreError) {
        self.failures.lock().unwrap().insert(op, Failure { error, remaining: None });
    }

    /// Make the next `times` calls of `op` fail with `error`.
    pub fn fail_times(&self, op: Operation, error: StoreError, times: u32) {
        self.failures.lock().unwrap().insert(op, Failure { error, remaining: Some(times) });
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    /// Keep tables created from now on in the creating state for `polls`
    /// status polls.
    pub fn set_creation_polls(&self, polls: u32) {
        *self.creation_polls.lock().unwrap() = polls;
    }

    pub fn is_creating(&self, table_name: &str) -> bool {
        self.tables.lock().unwrap().get(table_name).is_some_and(|t| t.creating > 0)
    }

    pub fn calls(&self) -> CallCounts { *self.calls.lock().unwrap() }

    pub fn table_count(&self) -> usize { self.tables.lock().unwrap().len() }

    pub fn has_table(&self, table_name: &str) -> bool {
        self.tables.lock().unwrap().contains_key(table_name)
    }

    pub fn key_field(&self, table_name: &str) -> Option<String> {
        self.tables.lock().unwrap().get(table_name).map(|t| t.key_field.clone())
    }

    pub fn tags(&self, table_name: &str) -> HashMap<String, String> {
        self.tables.lock().unwrap().get(table_name).map(|t| t.tags.clone()).unwrap_or_default()
    }

    /// Raw item as stored, key attribute included.
    pub fn item(&self, table_name: &str, row_key: &str) -> Option<Item> {
        self.tables.lock().unwrap().get(table_name).and_then(|t| t.rows.get(row_key).cloned())
    }

    /// Store a raw item, bypassing the codec. The key attribute is added.
    pub fn put_item(&self, table_name: &str, row_key: &str, mut item: Item) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(table_name).ok_or_else(|| not_found(table_name))?;
        item.insert(table.key_field.clone(), AttributeValue::S(row_key.to_string()));
        table.rows.insert(row_key.to_string(), item);
        Ok(())
    }

    /// Administrative delete; returns whether the row existed.
    pub fn delete_row(&self, table_name: &str, row_key: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(table_name).ok_or_else(|| not_found(table_name))?;
        Ok(table.rows.remove(row_key).is_some())
    }

    /// One status poll: `None` if the table is gone, else whether it is active.
    fn poll_status(&self, table_name: &str) -> Option<bool> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(table_name)?;
        if table.creating == 0 {
            return Some(true);
        }
        table.creating -= 1;
        Some(false)
    }

    async fn wait_until_active(&self, table_name: &str) -> Result<(), StoreError> {
        loop {
            match self.poll_status(table_name) {
                None => return Err(not_found(table_name)),
                Some(true) => return Ok(()),
                Some(false) => tokio::task::yield_now().await,
            }
        }
    }

    async fn enter(&self, op: Operation) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        {
            let mut calls = self.calls.lock().unwrap();
            match op {
                Operation::Describe => calls.describe += 1,
                Operation::Create => calls.create += 1,
                Operation::Tag => calls.tag += 1,
                Operation::Get => calls.get += 1,
                Operation::Put => calls.put += 1,
            }
        }
        let mut failures = self.failures.lock().unwrap();
        let Some(failure) = failures.get_mut(&op) else { return Ok(()) };
        let error = failure.error.clone();
        let exhausted = match failure.remaining.as_mut() {
            None => false,
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
        };
        if exhausted {
            failures.remove(&op);
        }
        Err(error)
    }
}

fn not_found(table_name: &str) -> StoreError {
    StoreError::NotFound(format!("Requested resource not found: Table: {table_name} not found"))
}

fn active<'a>(table: Option<&'a Table>, table_name: &str) -> Result<&'a Table, StoreError> {
    table.filter(|t| t.creating == 0).ok_or_else(|| not_found(table_name))
}

fn active_mut<'a>(table: Option<&'a mut Table>, table_name: &str) -> Result<&'a mut Table, StoreError> {
    table.filter(|t| t.creating == 0).ok_or_else(|| not_found(table_name))
}

fn normalize(value: AttributeValue) -> AttributeValue {
    match value {
        AttributeValue::N(n) => AttributeValue::N(normalize_number(&n)),
        AttributeValue::Ns(items) => AttributeValue::Ns(items.iter().map(|n| normalize_number(n)).collect()),
        AttributeValue::L(items) => AttributeValue::L(items.into_iter().map(normalize).collect()),
        AttributeValue::M(map) => AttributeValue::M(map.into_iter().map(|(k, v)| (k, normalize(v))).collect()),
        other => other,
    }
}

fn check_key(table: &Table, key_field: &str) -> Result<(), StoreError> {
    if table.key_field != key_field {
        return Err(StoreError::Validation(format!(
            "The provided key element does not match the schema: expected `{}`, got `{key_field}`",
            table.key_field
        )));
    }
    Ok(())
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn describe_store(&self, table_name: &str) -> Result<bool, StoreError> {
        self.enter(Operation::Describe).await?;
        if !self.has_table(table_name) {
            return Ok(false);
        }
        self.wait_until_active(table_name).await?;
        Ok(true)
    }

    async fn create_store(&self, table_name: &str, key_field: &str) -> Result<(), StoreError> {
        self.enter(Operation::Create).await?;
        let existed = {
            let mut tables = self.tables.lock().unwrap();
            let existed = tables.contains_key(table_name);
            if !existed {
                let creating = *self.creation_polls.lock().unwrap();
                tables.insert(
                    table_name.to_string(),
                    Table { key_field: key_field.to_string(), tags: HashMap::new(), rows: HashMap::new(), creating },
                );
            }
            existed
        };
        self.wait_until_active(table_name).await?;
        if existed {
            return Err(StoreError::AlreadyExists(format!("Table already exists: {table_name}")));
        }
        Ok(())
    }

    async fn tag_store(&self, table_name: &str) -> Result<(), StoreError> {
        self.enter(Operation::Tag).await?;
        let mut tables = self.tables.lock().unwrap();
        let table = active_mut(tables.get_mut(table_name), table_name)?;
        table.tags.insert(DESCRIPTION_TAG.to_string(), description_for(table_name));
        Ok(())
    }

    async fn get_row(
        &self,
        table_name: &str,
        key_field: &str,
        row_key: &str,
        value_field: &str,
    ) -> Result<Option<AttributeValue>, StoreError> {
        self.enter(Operation::Get).await?;
        let tables = self.tables.lock().unwrap();
        let table = active(tables.get(table_name), table_name)?;
        check_key(table, key_field)?;
        Ok(table.rows.get(row_key).and_then(|item| item.get(value_field).cloned()))
    }

    async fn put_row(
        &self,
        table_name: &str,
        key_field: &str,
        row_key: &str,
        value_field: &str,
        value: AttributeValue,
    ) -> Result<(), StoreError> {
        self.enter(Operation::Put).await?;
        if key_field == value_field {
            return Err(StoreError::Validation("key and value attributes must differ".into()));
        }
        let mut tables = self.tables.lock().unwrap();
        let table = active_mut(tables.get_mut(table_name), table_name)?;
        check_key(table, key_field)?;
        let item = HashMap::from([
            (key_field.to_string(), AttributeValue::S(row_key.to_string())),
            (value_field.to_string(), normalize(value)),
        ]);
        table.rows.insert(row_key.to_string(), item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_twice_reports_already_exists() {
        let store = MemoryRowStore::new();
        assert!(!store.describe_store("t").await.unwrap());
        store.create_store("t", "key").await.unwrap();
        assert!(store.describe_store("t").await.unwrap());
        let err = store.create_store("t", "key").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.table_count(), 1);
    }

    #[tokio::test]
    async fn put_replaces_whole_row() {
        let store = MemoryRowStore::new();
        store.create_store("t", "key").await.unwrap();
        store.put_row("t", "key", "r", "value", AttributeValue::S("one".into())).await.unwrap();
        store.put_row("t", "key", "r", "other", AttributeValue::S("two".into())).await.unwrap();

        assert_eq!(store.get_row("t", "key", "r", "value").await.unwrap(), None);
        assert_eq!(
            store.get_row("t", "key", "r", "other").await.unwrap(),
            Some(AttributeValue::S("two".into()))
        );
        assert_eq!(store.item("t", "r").unwrap()["key"], AttributeValue::S("r".into()));
    }

    #[tokio::test]
    async fn schema_and_table_are_validated() {
        let store = MemoryRowStore::new();
        assert!(matches!(
            store.get_row("missing", "key", "r", "value").await,
            Err(StoreError::NotFound(_))
        ));
        store.create_store("t", "key").await.unwrap();
        assert!(matches!(
            store.get_row("t", "pk", "r", "value").await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn injected_failures_expire() {
        let store = MemoryRowStore::new();
        store.fail_times(Operation::Describe, StoreError::Throttled("x".into()), 2);
        assert!(store.describe_store("t").await.is_err());
        assert!(store.describe_store("t").await.is_err());
        assert!(store.describe_store("t").await.is_ok());
        assert_eq!(store.calls().describe, 3);
    }

    #[tokio::test]
    async fn rows_are_unavailable_while_table_is_creating() {
        let store = MemoryRowStore::new();
        store.set_creation_polls(3);
        store.create_store("t", "key").await.unwrap();
        assert!(!store.is_creating("t"), "create returns once the table is active");

        store.tables.lock().unwrap().get_mut("t").unwrap().creating = 2;
        assert!(matches!(
            store.get_row("t", "key", "r", "value").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.describe_store("t").await.unwrap());
        assert!(!store.is_creating("t"));
        assert_eq!(store.get_row("t", "key", "r", "value").await.unwrap(), None);
    }

    #[tokio::test]
    async fn numbers_are_normalized_on_write() {
        let store = MemoryRowStore::new();
        store.create_store("t", "key").await.unwrap();
        let value = AttributeValue::M(HashMap::from([
            ("f".to_string(), AttributeValue::N("1.0".into())),
            ("l".to_string(), AttributeValue::L(vec![AttributeValue::N("2.50".into())])),
        ]));
        store.put_row("t", "key", "r", "value", value).await.unwrap();

        let Some(AttributeValue::M(m)) = store.get_row("t", "key", "r", "value").await.unwrap() else {
            panic!("expected map")
        };
        assert_eq!(m["f"], AttributeValue::N("1".into()));
        assert_eq!(m["l"], AttributeValue::L(vec![AttributeValue::N("2.5".into())]));
    }

    #[tokio::test]
    async fn tagging_records_description() {
        let store = MemoryRowStore::new();
        store.create_store("t", "key").await.unwrap();
        store.tag_store("t").await.unwrap();
        assert!(store.tags("t")[DESCRIPTION_TAG].contains("lambda-persistence"));
        assert!(store.delete_row("t", "nope").is_ok_and(|existed| !existed));
    }
}
