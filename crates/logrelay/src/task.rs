//! Supervision for background tasks.
//!
//! A supervised task that panics is caught, logged, and restarted with
//! exponential backoff; a task that returns normally (e.g. on cancellation)
//! ends supervision. The process never exits on a background-task fault.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::error;

/// Spawn `make()` and keep it alive across panics. `make` is invoked again
/// for every restart, so it should capture whatever state the task needs.
pub fn spawn_supervised<F, Fut>(name: &'static str, mut make: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut restarts = 0u32;
        loop {
            let run = tokio::spawn(make());
            match run.await {
                Ok(()) => break,
                Err(err) if err.is_panic() => {
                    restarts += 1;
                    let backoff = Duration::from_millis(100 * (1 << restarts.min(6)));
                    error!(
                        task = name,
                        restarts,
                        "background task panicked, restarting in {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(_) => break,
            }
        }
    })
}
