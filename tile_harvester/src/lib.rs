//! Concurrent map tile harvester: bounding-box tile enumeration, a bounded
//! worker pool with crash-safe resumable fetch, and two storage backends
//! (a plain directory tree or one/many MBTiles databases).

pub mod config;
pub mod controller;
pub mod error;
pub mod ledger;
pub mod provider;
pub mod reporter;
pub mod sink;
pub mod task_source;
pub mod tile_math;
pub mod worker;

pub use config::{RunConfig, SinkKind};
pub use controller::{Controller, RunState};
pub use error::{HarvestError, Result};
pub use provider::Provider;
pub use reporter::ProgressSnapshot;
