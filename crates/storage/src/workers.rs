use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

/// Handle to control and join a background worker.
///
/// Dropping the handle without calling [`WorkerHandle::shutdown`] also stops
/// the worker (its shutdown channel disconnects) but does not wait for it.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!(worker = self.name, "worker thread panicked");
            }
        }
    }
}

/// Spawn a named thread that calls `tick` every `interval` until shut down.
///
/// The first tick runs immediately. Errors are logged and the loop carries on
/// with the next tick.
pub fn spawn_periodic<F, E>(name: &'static str, interval: Duration, mut tick: F) -> io::Result<WorkerHandle>
where
    F: FnMut() -> Result<(), E> + Send + 'static,
    E: std::fmt::Display,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let join = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            debug!(worker = name, ?interval, "worker started");
            loop {
                if let Err(err) = tick() {
                    warn!(worker = name, error = %err, "worker tick failed");
                }

                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(worker = name, "worker stopped");
        })?;

    Ok(WorkerHandle {
        name,
        shutdown: shutdown_tx,
        join: Some(join),
    })
}
