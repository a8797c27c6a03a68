//! Purpose: Cross-cutting wrapper around dispatch: interrupt handling, debug
//! mode, and profiling.
//! Exports: `run`.
//! Role: The invocation lifecycle: everything that must happen around a
//! command regardless of where it executes.
//! Invariants: The interrupt listener is installed at most once per process.
//! Invariants: A started profiler is stopped on every exit path.

use std::path::Path;
use std::sync::Once;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cmds::{Command, Request, Response};
use crate::core::error::Error;
use crate::dispatch;
use crate::profiling::Profiler;

static INTERRUPT_HANDLER: Once = Once::new();

/// Runs one invocation end to end: interrupts, verbosity, profiling, then
/// dispatch. The response stream is handed back for the caller to drain.
pub fn run(req: &mut Request, root: &Command) -> Result<Response, Error> {
    install_interrupt_handler();

    let debug = debug_requested(req);
    init_tracing(debug);
    let _profiler = if debug {
        Some(Profiler::start(Path::new("."))?)
    } else {
        None
    };

    dispatch::dispatch(req, root)
    // The profiler guard drops here, after dispatch settles: CPU profile
    // flushed, then the heap snapshot, on success and failure alike.
}

/// Debug mode comes from the request option or from the environment.
fn debug_requested(req: &Request) -> bool {
    if matches!(req.option_bool("debug"), Some(true)) {
        return true;
    }
    env_flag("KEEL_DEBUG") || env_flag("DEBUG")
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| !matches!(value.as_str(), "" | "0" | "false"))
        .unwrap_or(false)
}

fn init_tracing(debug: bool) {
    let default = if debug { "keel=debug,warn" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // stdout belongs to the response stream; diagnostics go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// One background listener for the whole process. On interrupt it logs and
/// terminates immediately; a one-shot CLI invocation has nothing worth a
/// graceful drain.
fn install_interrupt_handler() {
    INTERRUPT_HANDLER.call_once(|| {
        match Signals::new([SIGINT, SIGTERM]) {
            Ok(mut signals) => {
                std::thread::spawn(move || {
                    if let Some(signal) = signals.forever().next() {
                        info!("received signal {signal}, terminating");
                        std::process::exit(130);
                    }
                });
            }
            Err(err) => warn!("failed to install interrupt handler: {err}"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::debug_requested;
    use crate::cmds::{Context, OptValue, Request};
    use std::path::PathBuf;

    #[test]
    fn debug_option_enables_debug_mode() {
        let mut req = Request::new(vec!["id".to_string()], Context::new(PathBuf::from(".")));
        req.set_option("debug", OptValue::Bool(true));
        assert!(debug_requested(&req));
    }
}
