//! Service state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! Caller (main.rs) executes the I/O implied by each action.
//!
//! Authenticating covers the first session token exchange. Transient
//! failures there (backend unreachable, token endpoint 429) back off
//! exponentially; anything else stops the process before a listener binds.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Request counters reported by `/health`
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn record(&self, failed: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Service states. Some fields are carried between transitions and only
/// read through `Debug` in logs.
#[derive(Debug)]
#[allow(dead_code)]
pub enum ServiceState {
    /// Loading config and resolving the credential pool
    Initializing,
    /// Exchanging the first session token
    Authenticating {
        retries: u32,
        listen_addr: SocketAddr,
    },
    /// Binding the HTTP listener
    Starting { listen_addr: SocketAddr },
    /// Serving requests
    Running { listen_addr: SocketAddr },
    /// Graceful shutdown, finishing in-flight requests
    Draining { deadline: Instant },
    /// Terminal state
    Stopped { exit_code: i32 },
    /// Transient startup failure waiting on its retry timer
    Error {
        error: String,
        retries: u32,
        listen_addr: SocketAddr,
    },
}

#[derive(Debug)]
pub enum ServiceEvent {
    /// Configuration parsed and credential pool resolved
    ConfigLoaded { listen_addr: SocketAddr },
    /// First session token exchanged
    Authenticated,
    /// Session exchange failed
    AuthFailed { error: String, transient: bool },
    /// HTTP listener bound and ready
    ListenerReady,
    /// SIGTERM/SIGINT received
    ShutdownSignal,
    /// Every in-flight request finished
    Drained,
    /// Drain deadline exceeded
    DrainTimeout,
    /// Retry backoff expired
    RetryTimer,
}

#[derive(Debug)]
pub enum ServiceAction {
    /// Exchange the first session token
    Authenticate,
    /// Bind HTTP listener on the given address
    StartListener { addr: SocketAddr },
    /// Set retry timer
    ScheduleRetry { delay: Duration },
    /// Stop accepting and wait up to `timeout` for in-flight requests
    Drain { timeout: Duration },
    /// Exit the process
    Shutdown { exit_code: i32 },
    /// No-op
    None,
}

/// Startup exchange retries before giving up
pub const MAX_AUTH_RETRIES: u32 = 5;

/// How long in-flight requests get after a shutdown signal
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: ServiceState, event: ServiceEvent) -> (ServiceState, ServiceAction) {
    match (state, event) {
        // --- Initializing ---
        (ServiceState::Initializing, ServiceEvent::ConfigLoaded { listen_addr }) => (
            ServiceState::Authenticating {
                retries: 0,
                listen_addr,
            },
            ServiceAction::Authenticate,
        ),

        // --- Authenticating ---
        (ServiceState::Authenticating { listen_addr, .. }, ServiceEvent::Authenticated) => (
            ServiceState::Starting { listen_addr },
            ServiceAction::StartListener { addr: listen_addr },
        ),

        (
            ServiceState::Authenticating {
                retries,
                listen_addr,
            },
            ServiceEvent::AuthFailed {
                error,
                transient: true,
            },
        ) if retries < MAX_AUTH_RETRIES => (
            ServiceState::Error {
                error,
                retries,
                listen_addr,
            },
            ServiceAction::ScheduleRetry {
                delay: Duration::from_secs(2u64.pow(retries)),
            },
        ),

        (ServiceState::Authenticating { .. }, ServiceEvent::AuthFailed { .. }) => (
            ServiceState::Stopped { exit_code: 1 },
            ServiceAction::Shutdown { exit_code: 1 },
        ),

        // --- Error recovery ---
        (
            ServiceState::Error {
                retries,
                listen_addr,
                ..
            },
            ServiceEvent::RetryTimer,
        ) => (
            ServiceState::Authenticating {
                retries: retries + 1,
                listen_addr,
            },
            ServiceAction::Authenticate,
        ),

        // --- Starting ---
        (ServiceState::Starting { listen_addr }, ServiceEvent::ListenerReady) => {
            (ServiceState::Running { listen_addr }, ServiceAction::None)
        }

        // --- Running ---
        (ServiceState::Running { .. }, ServiceEvent::ShutdownSignal) => (
            ServiceState::Draining {
                deadline: Instant::now() + DRAIN_TIMEOUT,
            },
            ServiceAction::Drain {
                timeout: DRAIN_TIMEOUT,
            },
        ),

        // --- Draining ---
        (ServiceState::Draining { .. }, ServiceEvent::Drained | ServiceEvent::DrainTimeout) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // --- Any other state + shutdown = stop ---
        (_, ServiceEvent::ShutdownSignal) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, ServiceAction::None),
    }
}
