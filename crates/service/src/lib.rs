//! Durable key/value map for AWS Lambda functions.
//! - `storage`: the row store seam with DynamoDB and in-memory backends.
//! - `codec`: JSON values to DynamoDB attribute values and back.
//! - `persistent_map`: the write-through map applications hold.
//!
//! ```no_run
//! # async fn handler() -> Result<(), service::errors::PersistenceError> {
//! use service::persistent_map::{OpenOptions, PersistentMap};
//! use service::storage::DynamoDbSettings;
//!
//! let mut data = PersistentMap::open_dynamodb(DynamoDbSettings::default(), OpenOptions::new()).await?;
//! let runs = data.get_as::<u64>("runs")?.unwrap_or(0);
//! data.insert("runs", runs + 1).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod errors;
pub mod observability;
pub mod persistent_map;
pub mod retry;
pub mod storage;

pub use errors::{PersistenceError, StoreError};
pub use persistent_map::{IoStats, OpenOptions, PersistentMap};
