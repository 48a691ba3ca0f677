//! Process-level helpers: signal identities and logging setup.

use tracing_subscriber::EnvFilter;

/// Signals the server reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM (graceful shutdown)
    Terminate,
    /// SIGPIPE (broken pipe - usually ignored)
    Pipe,
}

impl Signal {
    /// Signals masked in every worker thread so they reach the main thread.
    pub const WORKER_BLOCKED: [Signal; 3] = [Signal::Interrupt, Signal::Terminate, Signal::Pipe];

    pub fn signal_num(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Pipe => libc::SIGPIPE,
        }
    }
}

/// Install the global fmt subscriber. `RUST_LOG` wins over `default_filter`.
/// Calling it twice is harmless.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(filter)
        .try_init();
}
