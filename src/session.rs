//! Connection supervisor: managed sessions to the source and each target.
//!
//! A session is a live authenticated connection plus health state:
//!
//! ```text
//! Healthy ──(transport error)──▶ Reconnecting ──(A failures)──▶ Broken
//!    ▲                               │                            │
//!    └──────(reconnect ok)───────────┘        (next health tick)──┘
//! ```
//!
//! Connections are **lazy**: opened on first [`ManagedSession::acquire()`].
//! A session in `Broken` state is never handed out; callers get
//! [`SyncError::Unavailable`] and the next health tick owns recovery.
//!
//! Uses `redis::aio::ConnectionManager` internally, which multiplexes a
//! single TCP socket; cloning is cheap and shares the underlying
//! connection. AUTH and SELECT ride in the connection URL. Every caller
//! wraps its commands in the per-operation deadline from
//! [`ManagedSession::op_timeout()`] so a silently dead WAN link surfaces
//! within bounded time.

use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{EndpointConfig, TargetConfig};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::record::epoch_millis;
use crate::resilience::RetryConfig;

/// Health state of a managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected and answering PINGs.
    Healthy,
    /// Lost the link; a reconnect attempt is pending or in flight.
    Reconnecting,
    /// Exhausted reconnect attempts; fail fast until the next health tick.
    Broken,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Healthy => write!(f, "healthy"),
            SessionState::Reconnecting => write!(f, "reconnecting"),
            SessionState::Broken => write!(f, "broken"),
        }
    }
}

/// A managed connection to one Redis endpoint.
pub struct ManagedSession {
    /// Display name: the target name, or "source".
    name: String,
    endpoint: EndpointConfig,
    retry: RetryConfig,
    /// ConnectionManager is Clone and multiplexed, so sharing is cheap.
    conn: RwLock<Option<ConnectionManager>>,
    state: RwLock<SessionState>,
    failure_count: AtomicU64,
    last_success: AtomicU64,
    shutdown: AtomicBool,
}

impl ManagedSession {
    pub fn new(name: impl Into<String>, endpoint: EndpointConfig, retry: RetryConfig) -> Self {
        Self {
            name: name.into(),
            endpoint,
            retry,
            conn: RwLock::new(None),
            state: RwLock::new(SessionState::Reconnecting),
            failure_count: AtomicU64::new(0),
            last_success: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// Deadline applied to every command issued on this session.
    pub fn op_timeout(&self) -> Duration {
        self.endpoint.socket_timeout()
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Milliseconds since the last successful operation, `u64::MAX` if
    /// none yet.
    pub fn millis_since_success(&self) -> u64 {
        let last = self.last_success.load(Ordering::Acquire);
        if last == 0 {
            return u64::MAX;
        }
        epoch_millis().saturating_sub(last)
    }

    /// Borrow a live connection, connecting lazily if needed.
    ///
    /// Fails fast with [`SyncError::Unavailable`] while the session is
    /// Broken.
    pub async fn acquire(&self) -> Result<ConnectionManager> {
        if *self.state.read().await == SessionState::Broken {
            return Err(SyncError::Unavailable {
                endpoint: self.name.clone(),
            });
        }

        if let Some(conn) = self.conn.read().await.clone() {
            return Ok(conn);
        }

        self.connect().await?;
        self.conn.read().await.clone().ok_or_else(|| SyncError::Unavailable {
            endpoint: self.name.clone(),
        })
    }

    /// Open the connection with this session's configured retry policy.
    pub async fn connect(&self) -> Result<()> {
        let retry = self.retry.clone();
        self.connect_with(&retry).await
    }

    /// Open the connection with an explicit retry policy (the coordinator
    /// uses a bounded policy at startup so an unreachable source surfaces
    /// as exit code 3 instead of an endless loop).
    ///
    /// On exhausting `max_attempts` the session goes Broken.
    pub async fn connect_with(&self, retry: &RetryConfig) -> Result<()> {
        *self.state.write().await = SessionState::Reconnecting;
        metrics::record_session_state(&self.name, "reconnecting");
        info!(session = %self.name, address = %self.endpoint.address(), "Connecting");

        let client = Client::open(self.endpoint.redis_url()).map_err(|e| {
            SyncError::Config(format!("invalid endpoint {}: {}", self.endpoint.address(), e))
        })?;

        let mut attempt = 0usize;
        let mut delay = retry.initial_delay;

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(SyncError::Shutdown);
            }

            attempt += 1;

            let conn_result = timeout(retry.connection_timeout, async {
                let mut conn = client.get_connection_manager().await?;
                // Verify the link before declaring it healthy.
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok::<_, redis::RedisError>(conn)
            })
            .await;

            match conn_result {
                Ok(Ok(conn)) => {
                    *self.conn.write().await = Some(conn);
                    *self.state.write().await = SessionState::Healthy;
                    self.failure_count.store(0, Ordering::Release);
                    self.last_success.store(epoch_millis(), Ordering::Release);
                    metrics::record_session_state(&self.name, "healthy");

                    if attempt > 1 {
                        info!(session = %self.name, attempt, "Connected after retry");
                    } else {
                        info!(session = %self.name, "Connected");
                    }
                    return Ok(());
                }
                Ok(Err(e)) => {
                    self.failure_count.fetch_add(1, Ordering::AcqRel);

                    // An auth rejection never heals by retrying.
                    if e.kind() == redis::ErrorKind::AuthenticationFailed {
                        *self.state.write().await = SessionState::Broken;
                        metrics::record_session_state(&self.name, "broken");
                        error!(session = %self.name, error = %e, "Authentication rejected");
                        return Err(SyncError::Auth {
                            endpoint: self.name.clone(),
                            message: e.to_string(),
                        });
                    }

                    if attempt >= retry.max_attempts {
                        *self.state.write().await = SessionState::Broken;
                        metrics::record_session_state(&self.name, "broken");
                        error!(session = %self.name, attempt, error = %e, "Connect failed, session broken");
                        return Err(self.connect_error(attempt, &e.to_string()));
                    }

                    warn!(
                        session = %self.name,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Connect attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay, retry);
                }
                Err(_) => {
                    self.failure_count.fetch_add(1, Ordering::AcqRel);

                    if attempt >= retry.max_attempts {
                        *self.state.write().await = SessionState::Broken;
                        metrics::record_session_state(&self.name, "broken");
                        error!(
                            session = %self.name,
                            attempt,
                            timeout_ms = retry.connection_timeout.as_millis(),
                            "Connect timed out, session broken"
                        );
                        return Err(self.connect_error(attempt, "connect timeout"));
                    }

                    warn!(
                        session = %self.name,
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Connect attempt timed out, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay, retry);
                }
            }
        }
    }

    fn connect_error(&self, attempts: usize, message: &str) -> SyncError {
        let message = format!("connect failed after {} attempts: {}", attempts, message);
        if self.name == "source" {
            SyncError::SourceConnection { message }
        } else {
            SyncError::TargetConnection {
                name: self.name.clone(),
                message,
            }
        }
    }

    /// Drop the connection and mark the session for reconnect.
    pub async fn mark_reconnecting(&self) {
        *self.conn.write().await = None;
        *self.state.write().await = SessionState::Reconnecting;
        metrics::record_session_state(&self.name, "reconnecting");
        warn!(session = %self.name, "Session demoted to reconnecting");
    }

    /// Give up on the session until the next health tick.
    pub async fn mark_broken(&self) {
        *self.conn.write().await = None;
        *self.state.write().await = SessionState::Broken;
        metrics::record_session_state(&self.name, "broken");
        warn!(session = %self.name, "Session marked broken");
    }

    /// Record an operation outcome observed by a caller.
    pub async fn record_success(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.last_success.store(epoch_millis(), Ordering::Release);
    }

    pub async fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::AcqRel);
        self.mark_reconnecting().await;
    }

    /// PING under the per-operation deadline; success updates the health
    /// state, failure demotes it.
    pub async fn ping(&self) -> Result<Duration> {
        let mut conn = self.acquire().await?;
        let start = std::time::Instant::now();

        let result = timeout(self.op_timeout(), async {
            let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>(reply)
        })
        .await;

        match result {
            Ok(Ok(reply)) if reply == "PONG" => {
                self.record_success().await;
                let latency = start.elapsed();
                metrics::record_session_ping(&self.name, true, latency);
                Ok(latency)
            }
            Ok(Ok(reply)) => {
                self.record_failure().await;
                metrics::record_session_ping(&self.name, false, start.elapsed());
                Err(SyncError::redis_msg("PING", format!("unexpected reply: {}", reply)))
            }
            Ok(Err(e)) => {
                self.record_failure().await;
                metrics::record_session_ping(&self.name, false, start.elapsed());
                Err(SyncError::redis("PING", e))
            }
            Err(_) => {
                self.record_failure().await;
                metrics::record_session_ping(&self.name, false, start.elapsed());
                Err(SyncError::redis_msg("PING", "deadline exceeded"))
            }
        }
    }

    /// Broken sessions get one fresh chance per health tick.
    pub async fn revive(&self) {
        let mut state = self.state.write().await;
        if *state == SessionState::Broken {
            *state = SessionState::Reconnecting;
            self.failure_count.store(0, Ordering::Release);
            debug!(session = %self.name, "Broken session eligible for reconnect");
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

fn next_delay(current: Duration, retry: &RetryConfig) -> Duration {
    std::cmp::min(
        Duration::from_secs_f64(current.as_secs_f64() * retry.backoff_factor),
        retry.max_delay,
    )
}

/// Registry of the source session and one session per target.
pub struct SessionManager {
    source: Arc<ManagedSession>,
    targets: dashmap::DashMap<String, Arc<ManagedSession>>,
}

impl SessionManager {
    pub fn new(
        source_endpoint: EndpointConfig,
        targets: &[TargetConfig],
        target_retry: RetryConfig,
    ) -> Self {
        let source = Arc::new(ManagedSession::new(
            "source",
            source_endpoint,
            RetryConfig::source(),
        ));

        let map = dashmap::DashMap::new();
        for target in targets.iter().filter(|t| t.enabled) {
            let mut retry = target_retry.clone();
            retry.connection_timeout = target.endpoint.connect_timeout();
            map.insert(
                target.name.clone(),
                Arc::new(ManagedSession::new(
                    target.name.clone(),
                    target.endpoint.clone(),
                    retry,
                )),
            );
        }

        Self {
            source,
            targets: map,
        }
    }

    pub fn source(&self) -> Arc<ManagedSession> {
        Arc::clone(&self.source)
    }

    pub fn target(&self, name: &str) -> Option<Arc<ManagedSession>> {
        self.targets.get(name).map(|r| Arc::clone(r.value()))
    }

    pub fn targets(&self) -> Vec<Arc<ManagedSession>> {
        self.targets.iter().map(|r| Arc::clone(r.value())).collect()
    }

    /// Connect every target session in parallel, tolerating individual
    /// failures. Returns the number that came up.
    pub async fn connect_targets(&self) -> usize {
        let attempts = self.targets().into_iter().map(|session| async move {
            match session.connect().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(session = %session.name(), error = %e, "Target connect failed");
                    false
                }
            }
        });
        futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count()
    }

    pub async fn healthy_target_count(&self) -> usize {
        let mut count = 0;
        for session in self.targets() {
            if session.state().await == SessionState::Healthy {
                count += 1;
            }
        }
        count
    }

    pub fn shutdown_all(&self) {
        self.source.shutdown();
        for session in self.targets.iter() {
            session.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(name: &str) -> ManagedSession {
        ManagedSession::new(name, EndpointConfig::for_testing(6379), RetryConfig::testing())
    }

    #[tokio::test]
    async fn test_initial_state_reconnecting() {
        let session = test_session("t1");
        assert_eq!(session.state().await, SessionState::Reconnecting);
        assert_eq!(session.failure_count(), 0);
        assert_eq!(session.millis_since_success(), u64::MAX);
    }

    #[tokio::test]
    async fn test_broken_session_fails_fast() {
        let session = test_session("t1");
        session.mark_broken().await;

        let result = session.acquire().await;
        match result {
            Err(SyncError::Unavailable { endpoint }) => assert_eq!(endpoint, "t1"),
            other => panic!("expected Unavailable, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_revive_broken_session() {
        let session = test_session("t1");
        session.mark_broken().await;
        assert_eq!(session.state().await, SessionState::Broken);

        session.revive().await;
        assert_eq!(session.state().await, SessionState::Reconnecting);
        assert_eq!(session.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_revive_leaves_other_states_alone() {
        let session = test_session("t1");
        session.revive().await;
        assert_eq!(session.state().await, SessionState::Reconnecting);
    }

    #[tokio::test]
    async fn test_record_failure_demotes() {
        let session = test_session("t1");
        session.record_failure().await;
        assert_eq!(session.state().await, SessionState::Reconnecting);
        assert_eq!(session.failure_count(), 1);

        session.record_success().await;
        assert_eq!(session.failure_count(), 0);
        assert!(session.millis_since_success() < 1_000);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Healthy.to_string(), "healthy");
        assert_eq!(SessionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(SessionState::Broken.to_string(), "broken");
    }

    #[test]
    fn test_connect_error_kinds() {
        let source = ManagedSession::new(
            "source",
            EndpointConfig::for_testing(6379),
            RetryConfig::testing(),
        );
        assert!(matches!(
            source.connect_error(3, "refused"),
            SyncError::SourceConnection { .. }
        ));

        let target = test_session("t1");
        assert!(matches!(
            target.connect_error(3, "refused"),
            SyncError::TargetConnection { .. }
        ));
    }

    #[test]
    fn test_next_delay_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(1),
        };
        let d1 = next_delay(Duration::from_secs(1), &retry);
        assert_eq!(d1, Duration::from_secs(2));
        let d2 = next_delay(d1, &retry);
        assert_eq!(d2, Duration::from_secs(4));
        let d3 = next_delay(d2, &retry);
        assert_eq!(d3, Duration::from_secs(4));
    }

    #[test]
    fn test_manager_skips_disabled_targets() {
        let mut disabled = TargetConfig::for_testing("off", 6381);
        disabled.enabled = false;

        let manager = SessionManager::new(
            EndpointConfig::for_testing(6379),
            &[TargetConfig::for_testing("on", 6380), disabled],
            RetryConfig::testing(),
        );

        assert!(manager.target("on").is_some());
        assert!(manager.target("off").is_none());
        assert_eq!(manager.targets().len(), 1);
    }

    #[tokio::test]
    async fn test_manager_healthy_count_starts_zero() {
        let manager = SessionManager::new(
            EndpointConfig::for_testing(6379),
            &[
                TargetConfig::for_testing("t1", 6380),
                TargetConfig::for_testing("t2", 6381),
            ],
            RetryConfig::testing(),
        );
        assert_eq!(manager.healthy_target_count().await, 0);
    }

    #[test]
    fn test_manager_shutdown_all() {
        let manager = SessionManager::new(
            EndpointConfig::for_testing(6379),
            &[TargetConfig::for_testing("t1", 6380)],
            RetryConfig::testing(),
        );
        manager.shutdown_all();
        assert!(manager.source().shutdown.load(Ordering::Acquire));
        assert!(manager.target("t1").unwrap().shutdown.load(Ordering::Acquire));
    }
}
