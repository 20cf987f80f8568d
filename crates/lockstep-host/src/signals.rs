//! Signal handling for graceful host shutdown.
//!
//! SIGINT and SIGTERM stop the clock at the next batch boundary; SIGHUP asks
//! for a progress line. The handlers only touch atomics, which is all an
//! async-signal-safe handler may do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

static STOP_FLAG: AtomicBool = AtomicBool::new(false);
static STATUS_FLAG: AtomicBool = AtomicBool::new(false);

/// Signals the host reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM
    Terminate,
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGHUP, used to request a progress report.
    Hangup,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Flags shared between the signal glue and the run loop.
#[derive(Debug, Default)]
pub struct SignalState {
    stop_requested: AtomicBool,
    status_requested: AtomicBool,
}

impl SignalState {
    /// Create a state with nothing requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the run loop should stop.
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Relaxed)
    }

    /// Consume a pending progress-report request.
    #[inline]
    pub fn take_status_request(&self) -> bool {
        self.status_requested.swap(false, Ordering::Relaxed)
    }

    /// Ask the run loop to stop.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Relaxed);
    }

    /// Ask for a progress report.
    pub fn request_status(&self) {
        self.status_requested.store(true, Ordering::Relaxed);
    }
}

/// Owner of the process signal handlers.
#[derive(Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Register the process handlers and return a handle to their flags.
    ///
    /// On non-Unix targets only manual stop requests are available.
    pub fn install() -> std::io::Result<Self> {
        let handler = Self::detached();

        #[cfg(unix)]
        register_unix_handlers()?;

        Ok(handler)
    }

    /// A handler that never sees process signals, for tests and embedding.
    pub fn detached() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    /// Whether a stop was requested, by signal or manually.
    pub fn stop_requested(&self) -> bool {
        if STOP_FLAG.swap(false, Ordering::Relaxed) {
            info!("Stop signal received");
            self.state.request_stop();
        }
        self.state.stop_requested()
    }

    /// Consume a pending progress-report request.
    pub fn take_status_request(&self) -> bool {
        if STATUS_FLAG.swap(false, Ordering::Relaxed) {
            self.state.request_status();
        }
        self.state.take_status_request()
    }

    /// Manually request a stop.
    pub fn request_stop(&self) {
        info!("Manual stop requested");
        self.state.request_stop();
    }
}

#[cfg(unix)]
fn register_unix_handlers() -> std::io::Result<()> {
    use std::os::raw::c_int;

    extern "C" fn on_stop(_: c_int) {
        STOP_FLAG.store(true, Ordering::Relaxed);
    }

    extern "C" fn on_status(_: c_int) {
        STATUS_FLAG.store(true, Ordering::Relaxed);
    }

    let handlers: [(c_int, extern "C" fn(c_int), SignalKind); 3] = [
        (libc::SIGTERM, on_stop, SignalKind::Terminate),
        (libc::SIGINT, on_stop, SignalKind::Interrupt),
        (libc::SIGHUP, on_status, SignalKind::Hangup),
    ];
    for (signum, handler, kind) in handlers {
        // SAFETY: the handlers only store to static atomics.
        let previous = unsafe { libc::signal(signum, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
        debug!(signal = %kind, "Signal handler registered");
    }
    Ok(())
}
