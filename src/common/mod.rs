//! Common utilities and types shared across minikv-client

pub mod config;
pub mod deadline;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod utils;

pub use config::ClientConfig;
pub use deadline::{shutdown_channel, Deadline, Shutdown, ShutdownTrigger};
pub use error::{Error, ErrorKind, OpKind, Result};
pub use hash::{crc64, partition_hash};
pub use metrics::{ClientMetrics, MetricsSnapshot, TaskCounter};
pub use utils::{parse_duration, validate_hash_key, validate_table_name};
