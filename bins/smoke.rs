//! End-to-end check against a real DynamoDB endpoint.
//!
//! Drops and recreates a dedicated test table, then walks a persistent map
//! through cold starts, warm starts and every kind of mutation while
//! asserting how many reads and writes each step costs.
//!
//! Needs AWS credentials with CreateTable, DeleteTable, TagResource,
//! DescribeTable, GetItem, PutItem and DeleteItem on the test table.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context};
use chrono::{DateTime, Utc};
use dotenvy::dotenv;
use serde_json::json;
use service::storage::{DynamoDbRowStore, DynamoDbSettings, RowStore};
use service::retry::RetryPolicy;
use service::{IoStats, OpenOptions, PersistenceError, PersistentMap};
use tokio::sync::{Mutex, OnceCell};
use tracing::{error, info};
use uuid::Uuid;

const DEFAULT_TEST_TABLE: &str = "TestingAWSLambdaPersistence";

// Survives warm invocations of the same process; a cold start reloads.
static DATA: OnceCell<Mutex<PersistentMap>> = OnceCell::const_new();

fn init_logging() {
    dotenv().ok();
    common::utils::logging::init_logging_from_env();
    info!(service = "persistence-smoke", event = "logger_init", "tracing subscriber initialized");
}

fn step(name: &str, started: Instant, stats: IoStats) {
    info!(
        step = name,
        elapsed_ms = started.elapsed().as_millis() as u64,
        gets = stats.gets,
        puts = stats.puts,
        "step finished"
    );
}

async fn open(store: &Arc<DynamoDbRowStore>, options: &OpenOptions) -> anyhow::Result<PersistentMap> {
    let map = PersistentMap::open(store.clone(), options.clone()).await?;
    Ok(map)
}

/// What a handler does with the cached map: count its own invocations.
async fn handle_invocation(store: &Arc<DynamoDbRowStore>, options: &OpenOptions) -> anyhow::Result<u64> {
    let cell = DATA
        .get_or_try_init(|| async { open(store, options).await.map(Mutex::new) })
        .await?;
    let mut data = cell.lock().await;
    let invocations = data.get_as::<u64>("invocations")?.unwrap_or(0) + 1;
    data.insert("invocations", invocations).await?;
    Ok(invocations)
}

async fn run(store: Arc<DynamoDbRowStore>, cfg: &configs::AppConfig, table: &str, row_key: &str) -> anyhow::Result<()> {
    // Ignore PERSISTENCE_* so the run cannot be pointed at a production table.
    let options = OpenOptions::new()
        .explicit(cfg.persistence.clone())
        .setting(configs::Setting::TableName, table)
        .setting(configs::Setting::TableKey, row_key)
        .retry(RetryPolicy::from_config(&cfg.retry))
        .lookup(|_| None);
    let key_field = cfg
        .persistence
        .key_field_name
        .clone()
        .unwrap_or_else(|| configs::resolver::DEFAULT_KEY_FIELD_NAME.to_string());

    if store.describe_store(table).await? {
        info!(%table, "deleting existing test table");
        store.delete_store(table).await?;
    }

    let started = Instant::now();
    let data = open(&store, &options).await?;
    step("create table", started, data.stats());
    ensure!(data.stats() == IoStats { gets: 0, puts: 1 }, "cold create: {:?}", data.stats());

    let started = Instant::now();
    let data = open(&store, &options.clone().entry("foo", json!(42))).await?;
    step("open with initial data", started, data.stats());
    ensure!(data.stats() == IoStats { gets: 1, puts: 1 }, "open with data: {:?}", data.stats());
    ensure!(data.get("foo") == Some(&json!(42)));

    let started = Instant::now();
    let mut data = open(&store, &options).await?;
    step("warm open", started, data.stats());
    ensure!(data.stats() == IoStats { gets: 1, puts: 0 }, "warm open: {:?}", data.stats());
    ensure!(data.get("foo") == Some(&json!(42)));

    let started = Instant::now();
    data.insert("foo", 52).await?;
    step("insert", started, data.stats());
    ensure!(data.stats().puts == 1 && data.get("foo") == Some(&json!(52)));

    let started = Instant::now();
    data.update([("foo", json!(62)), ("bar", json!("buz"))]).await?;
    step("update", started, data.stats());
    ensure!(data.stats().puts == 2 && data.get("bar") == Some(&json!("buz")));

    let started = Instant::now();
    data.remove("bar").await?;
    step("remove", started, data.stats());
    ensure!(data.stats().puts == 3 && !data.contains_key("bar"));

    let started = Instant::now();
    data.clear().await?;
    step("clear", started, data.stats());
    ensure!(data.stats().puts == 4 && data.is_empty());

    let stamp = Utc::now();
    let mut data = open(&store, &options).await?;
    data.insert("foo", 42).await?;
    data.insert("bar", stamp).await?;
    let data = open(&store, &options).await?;
    ensure!(data.get_as::<DateTime<Utc>>("bar")? == Some(stamp), "timestamp did not round trip");

    info!("reading from an existing table with a missing row");
    store.delete_row(table, &key_field, row_key).await?;
    let mut data = open(&store, &options).await?;
    ensure!(data.is_empty());
    ensure!(data.stats() == IoStats { gets: 1, puts: 1 }, "missing row: {:?}", data.stats());
    data.update([("bar", json!("2021-11-13T03:16:08.549614")), ("foo", json!({"buz": "bad"}))])
        .await?;
    ensure!(data.stats().puts == 2);

    let first = handle_invocation(&store, &options).await?;
    let second = handle_invocation(&store, &options).await?;
    ensure!(second == first + 1, "warm invocation did not reuse the cached map");

    let deleted = store.delete_store(table).await.context("cleanup")?;
    info!(%table, deleted, "smoke test passed");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let run_id = Uuid::new_v4();
    let version = env!("CARGO_PKG_VERSION");
    info!(service = "persistence-smoke", event = "start", %run_id, version, "smoke test starting");

    let cfg = match configs::AppConfig::load_and_validate() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(service = "persistence-smoke", event = "config_invalid", error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    let table = std::env::var("SMOKE_TABLE_NAME").unwrap_or_else(|_| DEFAULT_TEST_TABLE.to_string());
    let row_key = cfg
        .persistence
        .table_key
        .clone()
        .or_else(|| std::env::var(configs::resolver::FUNCTION_NAME_VAR).ok())
        .unwrap_or_else(|| "persistence-smoke".to_string());

    let store = Arc::new(DynamoDbRowStore::from_env(DynamoDbSettings::from(&cfg.dynamodb)).await);
    match run(store, &cfg, &table, &row_key).await {
        Ok(()) => {
            info!(service = "persistence-smoke", event = "stop", %run_id, "smoke test succeeded");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(service = "persistence-smoke", event = "failed", %run_id, error = ?e, "smoke test failed");
            if let Some(guidance) = e.downcast_ref::<PersistenceError>().and_then(PersistenceError::permission_guidance) {
                error!(service = "persistence-smoke", event = "missing_permissions", "{guidance}");
            }
            ExitCode::FAILURE
        }
    }
}
