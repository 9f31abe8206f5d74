//! Pre-fork worker pool.
//!
//! Each worker is a share-nothing event loop with its own `SO_REUSEPORT`
//! listener on the server's address, its own channel registry, and its own
//! admission state, so the configured caps apply per worker. The kernel
//! spreads incoming connections across the listeners. All workers observe
//! one shared shutdown state: a signal or a
//! [`ShutdownHandle`](crate::ShutdownHandle) request stops
//! the whole pool.

use std::thread;
use std::time::Duration;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::config::ServeOptions;
use crate::error::{ServerError, ServerResult};
use crate::server::Server;

/// Interval at which the coordinating thread checks for worker exits.
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(100);

/// Runs `primary` and `opts.workers - 1` siblings, coordinating signal
/// handling and shutdown from the calling thread. Blocks until the pool has
/// drained.
pub(crate) fn serve_prefork(primary: &mut Server, opts: &ServeOptions) -> ServerResult<()> {
    let worker_count = resolve_worker_count(opts.workers);
    primary.log_start(true);
    tracing::info!(workers = worker_count, "starting worker pool");

    let shutdown = primary.shutdown_state();

    // Workers never install their own signal handlers; the coordinator
    // below owns the signals and fans the request out through the shared
    // shutdown state.
    let worker_opts = ServeOptions {
        timeout: opts.timeout,
        blocking: true,
        handle_interrupt: false,
        workers: 1,
    };

    let mut signals = if opts.handle_interrupt {
        Some(
            Signals::new([SIGINT, SIGTERM])
                .map_err(|e| ServerError::Config(format!("failed to install signal handler: {e}")))?,
        )
    } else {
        None
    };

    let mut siblings = Vec::with_capacity(worker_count.saturating_sub(1));
    for _ in 1..worker_count {
        siblings.push(primary.spawn_sibling()?);
    }

    let mut first_error: Option<ServerError> = None;
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(worker_count);
        for (index, mut sibling) in siblings.into_iter().enumerate() {
            let handle = thread::Builder::new()
                .name(format!("portcullis-worker-{}", index + 1))
                .spawn_scoped(scope, move || sibling.run(&worker_opts));
            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::error!(error = %e, "failed to spawn worker thread");
                    first_error.get_or_insert(ServerError::Io(e));
                    shutdown.request();
                }
            }
        }

        let primary_handle = thread::Builder::new()
            .name("portcullis-worker-0".to_string())
            .spawn_scoped(scope, || primary.run(&worker_opts));
        match primary_handle {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn worker thread");
                first_error.get_or_insert(ServerError::Io(e));
                shutdown.request();
            }
        }

        // Supervise: forward signals into the shared shutdown state and stop
        // the pool as soon as any worker exits.
        loop {
            if let Some(signals) = signals.as_mut() {
                if signals.pending().next().is_some() {
                    tracing::info!("received interrupt signal");
                    shutdown.request();
                }
            }
            if shutdown.requested() || handles.iter().any(|h| h.is_finished()) {
                shutdown.request();
                break;
            }
            thread::sleep(SUPERVISE_INTERVAL);
        }

        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "worker exited with error");
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    tracing::error!("worker thread panicked");
                    first_error.get_or_insert(ServerError::Config(
                        "worker thread panicked".to_string(),
                    ));
                }
            }
        }
    });

    match first_error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Resolves the configured worker count; 0 means one worker per available
/// CPU.
fn resolve_worker_count(configured: usize) -> usize {
    if configured == 0 {
        thread::available_parallelism().map_or(1, std::num::NonZero::get)
    } else {
        configured
    }
}
