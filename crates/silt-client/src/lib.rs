//! silt-client - Client half of the Silt sync engine
//!
//! Durable local entity cache and mutation queue (libsql), an HTTP
//! transport to the sync server, a sync orchestrator driving the
//! pull/push cycle, and a network quality monitor.

pub mod db;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod store;
pub mod transport;

pub use error::{ClientError, Result};
pub use monitor::{ConnectionType, MonitorConfig, NetworkMonitor, NetworkState};
pub use orchestrator::{SyncCycleReport, SyncOrchestrator};
pub use store::LocalStore;
pub use transport::{HttpSyncTransport, SyncTransport};
