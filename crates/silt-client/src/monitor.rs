//! Network quality monitor
//!
//! Periodically probes the server's health endpoint, tracks
//! online/offline and slow-connection state, and runs a bounded
//! exponential-backoff reconnect loop after going offline. The monitor
//! only observes; it never triggers a sync cycle itself.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::transport::SyncTransport;

/// How the device is connected, when the platform can tell us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    #[default]
    Unknown,
    Wifi,
    Cellular,
    Ethernet,
}

/// Snapshot of current network quality
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkState {
    pub is_online: bool,
    pub is_slow_connection: bool,
    pub connection_type: ConnectionType,
    /// Last time a probe succeeded (unix ms)
    pub last_online_at: Option<i64>,
    /// Consecutive reconnect attempts since going offline
    pub retry_attempts: u32,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            // Optimistic until the first probe says otherwise
            is_online: true,
            is_slow_connection: false,
            connection_type: ConnectionType::Unknown,
            last_online_at: None,
            retry_attempts: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between routine probes
    pub probe_interval: Duration,
    /// A probe slower than this counts as failed
    pub probe_timeout: Duration,
    /// A successful probe slower than this flags a slow connection
    pub slow_threshold: Duration,
    /// First reconnect delay; doubles per attempt
    pub backoff_base: Duration,
    /// Upper bound on the reconnect delay
    pub backoff_cap: Duration,
    /// Reconnect attempts before the monitor falls back to routine probing
    pub max_retry_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            slow_threshold: Duration::from_secs(3),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            max_retry_attempts: 8,
        }
    }
}

pub struct NetworkMonitor<T: SyncTransport> {
    transport: T,
    config: MonitorConfig,
    state: Arc<RwLock<NetworkState>>,
}

impl<T: SyncTransport> NetworkMonitor<T> {
    pub fn new(transport: T, config: MonitorConfig) -> Self {
        Self {
            transport,
            config,
            state: Arc::new(RwLock::new(NetworkState::default())),
        }
    }

    /// Cheap copy of the current state for readers
    #[must_use]
    pub fn snapshot(&self) -> NetworkState {
        self.state
            .read()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    /// Record what the platform knows about the link (optional)
    pub fn set_connection_type(&self, connection_type: ConnectionType) {
        if let Ok(mut state) = self.state.write() {
            state.connection_type = connection_type;
        }
    }

    /// Probe the server once and update the state. Returns whether the
    /// server was reachable.
    pub async fn probe_once(&self) -> bool {
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.config.probe_timeout, self.transport.health()).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(())) => {
                let slow = elapsed > self.config.slow_threshold;
                if let Ok(mut state) = self.state.write() {
                    if !state.is_online {
                        tracing::info!(rtt_ms = elapsed.as_millis() as u64, "Back online");
                    }
                    state.is_online = true;
                    state.is_slow_connection = slow;
                    state.last_online_at = Some(chrono::Utc::now().timestamp_millis());
                    state.retry_attempts = 0;
                }
                if slow {
                    tracing::warn!(rtt_ms = elapsed.as_millis() as u64, "Connection is slow");
                }
                true
            }
            Ok(Err(error)) => {
                self.mark_offline();
                tracing::warn!(%error, "Health probe failed");
                false
            }
            Err(_) => {
                self.mark_offline();
                tracing::warn!(
                    timeout_ms = self.config.probe_timeout.as_millis() as u64,
                    "Health probe timed out"
                );
                false
            }
        }
    }

    /// Reset the backoff counter and probe immediately
    pub async fn retry_now(&self) -> bool {
        if let Ok(mut state) = self.state.write() {
            state.retry_attempts = 0;
        }
        self.probe_once().await
    }

    /// Routine probe loop; callers spawn this and abort the task to stop
    pub async fn run(&self) {
        loop {
            let was_online = self.snapshot().is_online;
            let online = self.probe_once().await;
            if was_online && !online {
                self.reconnect_with_backoff().await;
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }
    }

    async fn reconnect_with_backoff(&self) {
        for attempt in 0..self.config.max_retry_attempts {
            let delay = backoff_delay(attempt, self.config.backoff_base, self.config.backoff_cap);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect backoff");
            tokio::time::sleep(delay).await;

            if let Ok(mut state) = self.state.write() {
                state.retry_attempts = attempt + 1;
            }
            if self.probe_once().await {
                return;
            }
        }
        tracing::warn!(
            attempts = self.config.max_retry_attempts,
            "Reconnect attempts exhausted; falling back to routine probing"
        );
    }

    fn mark_offline(&self) {
        if let Ok(mut state) = self.state.write() {
            state.is_online = false;
            state.is_slow_connection = false;
        }
    }
}

/// Delay before reconnect `attempt` (0-based): base doubled per attempt,
/// capped.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |delay| delay.min(cap))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use pretty_assertions::assert_eq;
    use silt_core::protocol::{
        PullQuery, PullResponse, PushRequest, PushResponse, ResolveConflictRequest,
        SyncStatusResponse, TimestampResponse,
    };

    use super::*;
    use crate::error::{ClientError, Result};

    struct FlakyTransport {
        healthy: AtomicBool,
        delay: Duration,
    }

    impl FlakyTransport {
        fn new(healthy: bool) -> Self {
            Self {
                healthy: AtomicBool::new(healthy),
                delay: Duration::ZERO,
            }
        }
    }

    impl SyncTransport for &FlakyTransport {
        async fn pull(&self, _query: &PullQuery) -> Result<PullResponse> {
            Err(ClientError::Transport("not wired in this fake".to_string()))
        }

        async fn push(&self, _request: &PushRequest) -> Result<PushResponse> {
            Err(ClientError::Transport("not wired in this fake".to_string()))
        }

        async fn resolve_conflict(&self, _request: &ResolveConflictRequest) -> Result<()> {
            Err(ClientError::Transport("not wired in this fake".to_string()))
        }

        async fn status(&self) -> Result<SyncStatusResponse> {
            Err(ClientError::Transport("not wired in this fake".to_string()))
        }

        async fn server_timestamp(&self) -> Result<TimestampResponse> {
            Err(ClientError::Transport("not wired in this fake".to_string()))
        }

        async fn health(&self) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ClientError::Transport("connection refused".to_string()))
            }
        }
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            probe_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(100),
            slow_threshold: Duration::from_millis(20),
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
            max_retry_attempts: 3,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn probe_tracks_offline_and_recovery() {
        let transport = FlakyTransport::new(false);
        let monitor = NetworkMonitor::new(&transport, fast_config());

        assert!(!monitor.probe_once().await);
        let state = monitor.snapshot();
        assert!(!state.is_online);
        assert_eq!(state.last_online_at, None);

        transport.healthy.store(true, Ordering::SeqCst);
        assert!(monitor.retry_now().await);
        let state = monitor.snapshot();
        assert!(state.is_online);
        assert!(state.last_online_at.is_some());
        assert_eq!(state.retry_attempts, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_probe_flags_slow_connection() {
        let transport = FlakyTransport {
            healthy: AtomicBool::new(true),
            delay: Duration::from_millis(40),
        };
        let monitor = NetworkMonitor::new(&transport, fast_config());

        assert!(monitor.probe_once().await);
        let state = monitor.snapshot();
        assert!(state.is_online);
        assert!(state.is_slow_connection);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn probe_timeout_counts_as_offline() {
        let transport = FlakyTransport {
            healthy: AtomicBool::new(true),
            delay: Duration::from_millis(200),
        };
        let monitor = NetworkMonitor::new(&transport, fast_config());

        assert!(!monitor.probe_once().await);
        assert!(!monitor.snapshot().is_online);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backoff_recovers_when_server_returns() {
        let transport = FlakyTransport::new(false);
        let monitor = NetworkMonitor::new(&transport, fast_config());

        assert!(!monitor.probe_once().await);
        transport.healthy.store(true, Ordering::SeqCst);
        monitor.reconnect_with_backoff().await;

        let state = monitor.snapshot();
        assert!(state.is_online);
        assert_eq!(state.retry_attempts, 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_delay(0, base, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(5, base, cap), Duration::from_secs(32));
        assert_eq!(backoff_delay(10, base, cap), cap);
        assert_eq!(backoff_delay(40, base, cap), cap);
    }
}
