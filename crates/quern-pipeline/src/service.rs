//! Service plumbing shared by the pipeline binaries.
//!
//! Every service is a long-running loop that stops accepting work on
//! SIGINT/SIGTERM, drains outstanding work within a bounded grace
//! period ([`drain_tasks`]), and exits cleanly. Transient collaborator
//! failures are retried forever with bounded exponential backoff and
//! never surface to a node.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

/// Grace period granted to in-flight work during shutdown.
pub const DRAIN_GRACE: Duration = Duration::from_secs(30);

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Receiving side of the shutdown notification.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown is requested.
    pub async fn triggered(&mut self) {
        // An error means the controller is gone, which also means stop.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    /// Returns true once shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Sending side of the shutdown notification.
#[derive(Debug)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    /// Requests shutdown of every holder of the paired signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Creates a linked shutdown controller/signal pair.
#[must_use]
pub fn shutdown_pair() -> (ShutdownController, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownController { tx }, ShutdownSignal { rx })
}

/// Triggers the controller on SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an I/O error when signal handlers cannot be installed.
pub async fn watch_signals(controller: ShutdownController) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = interrupt.recv() => tracing::info!("received SIGINT"),
        _ = terminate.recv() => tracing::info!("received SIGTERM"),
    }
    controller.trigger();
    Ok(())
}

/// Waits up to `grace` for every task in the set to finish, aborting
/// whatever is still running once the window closes.
///
/// Services call this from their shutdown path with [`DRAIN_GRACE`] so
/// in-flight work gets a bounded chance to land its node updates.
pub async fn drain_tasks(tasks: &mut JoinSet<()>, grace: Duration) {
    if tasks.is_empty() {
        return;
    }
    tracing::info!(outstanding = tasks.len(), "draining in-flight work");

    let drained = tokio::time::timeout(grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            outstanding = tasks.len(),
            "drain grace elapsed, aborting remaining work"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

/// Bounded exponential backoff for transient collaborator failures.
#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff at its base delay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next delay and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let delay = BACKOFF_BASE.saturating_mul(1 << exp);
        delay.min(BACKOFF_CAP)
    }

    /// Resets the schedule after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= BACKOFF_CAP);
        }
        assert_eq!(backoff.next_delay(), BACKOFF_CAP);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn shutdown_signal_observes_trigger() {
        let (controller, mut signal) = shutdown_pair();
        assert!(!signal.is_triggered());
        controller.trigger();
        signal.triggered().await;
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn drain_waits_for_finished_tasks() {
        let mut tasks = JoinSet::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tasks.spawn(async move {
            let _ = rx.await;
        });
        tx.send(()).unwrap();

        drain_tasks(&mut tasks, Duration::from_secs(5)).await;
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn drain_aborts_stragglers_after_grace() {
        let mut tasks = JoinSet::new();
        tasks.spawn(async {
            // Never completes on its own.
            std::future::pending::<()>().await;
        });

        drain_tasks(&mut tasks, Duration::from_millis(50)).await;
        assert!(tasks.is_empty());
    }
}
