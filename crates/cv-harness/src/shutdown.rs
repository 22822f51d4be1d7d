use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal: cooperative cancellation
// ---------------------------------------------------------------------------

/// Level-triggered cancellation flag with drain accounting.
///
/// Loops `select!` on [`ShutdownSignal::cancelled`] next to their work. Unlike
/// an edge-triggered broadcast, a loop that starts waiting after
/// [`ShutdownSignal::trigger`] still observes the cancellation.
///
/// ```ignore
/// let signal = ShutdownSignal::new();
/// let s = signal.clone();
/// tokio::spawn(async move {
///     tokio::select! {
///         _ = s.cancelled() => {}
///         _ = do_work() => {}
///     }
/// });
/// signal.trigger();
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    drain_tx: Arc<watch::Sender<usize>>,
    drain_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = watch::channel(0);
        Self {
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            drain_tx: Arc::new(drain_tx),
            drain_rx,
        }
    }

    /// Check if shutdown has been triggered (non-blocking).
    pub fn is_shutting_down(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Trigger shutdown. Returns `false` if it was already triggered.
    pub fn trigger(&self) -> bool {
        let first = self.cancel_tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        });
        if first {
            debug!("shutdown signal triggered");
        }
        first
    }

    /// Resolves once [`ShutdownSignal::trigger`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        // An error means every sender is gone, which can only happen once
        // all clones of this signal are dropped.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Notify that a component has finished draining.
    pub fn confirm_drained(&self) {
        self.drain_tx.send_modify(|count| *count += 1);
    }

    pub fn drained(&self) -> usize {
        *self.drain_rx.borrow()
    }

    /// Wait for `expected` components to confirm drain, with a timeout.
    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainResult {
        let mut rx = self.drain_rx.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|n| *n >= expected))
            .await
            .map(|r| r.map(|n| *n));
        match waited {
            Ok(Ok(n)) => DrainResult::Complete(n),
            Ok(Err(_)) => DrainResult::Complete(self.drained()),
            Err(_) => {
                let confirmed = self.drained();
                warn!(
                    confirmed,
                    expected, "drain timeout, some components did not confirm"
                );
                DrainResult::Timeout {
                    confirmed,
                    expected,
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DrainResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    /// All expected components confirmed drain.
    Complete(usize),
    /// Timeout expired before all components confirmed.
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

// ---------------------------------------------------------------------------
// ShutdownGuard: RAII guard that confirms drain on drop
// ---------------------------------------------------------------------------

/// Calls `confirm_drained()` when dropped.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl ShutdownGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

// ---------------------------------------------------------------------------
// TaskScope: a set of background tasks under one signal
// ---------------------------------------------------------------------------

/// Owns background tasks that share one [`ShutdownSignal`].
///
/// Every task spawned through the scope holds a [`ShutdownGuard`], so
/// [`TaskScope::shutdown`] can wait for them to wind down.
#[derive(Debug)]
pub struct TaskScope {
    name: &'static str,
    signal: ShutdownSignal,
    handles: Vec<JoinHandle<()>>,
}

impl TaskScope {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            signal: ShutdownSignal::new(),
            handles: Vec::new(),
        }
    }

    /// A clone of the scope's signal, for loops that watch it.
    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Spawn `fut`. The future is responsible for watching [`TaskScope::signal`].
    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = ShutdownGuard::new(self.signal.clone());
        self.handles.push(tokio::spawn(async move {
            let _guard = guard;
            fut.await;
        }));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel and abort every task without waiting for them.
    pub fn cancel_now(self) {
        self.signal.trigger();
        for handle in &self.handles {
            handle.abort();
        }
        debug!(scope = self.name, tasks = self.handles.len(), "scope cancelled");
    }

    /// Cancel, then give tasks up to `grace` to finish before aborting them.
    pub async fn shutdown(self, grace: Duration) -> DrainResult {
        self.signal.trigger();
        let result = self.signal.wait_for_drain(self.handles.len(), grace).await;
        for handle in &self.handles {
            if !handle.is_finished() {
                handle.abort();
            }
        }
        info!(scope = self.name, ?result, "scope shut down");
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn new_signal_is_not_shutting_down() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
    }

    #[test]
    fn double_trigger_reports_once() {
        let signal = ShutdownSignal::new();
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.clone().is_shutting_down());
    }

    #[tokio::test]
    async fn late_waiter_still_sees_cancellation() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let r = tokio::time::timeout(Duration::from_millis(100), signal.cancelled()).await;
        assert!(r.is_ok());
    }

    #[tokio::test]
    async fn drain_times_out_when_guard_held() {
        let signal = ShutdownSignal::new();
        let _guard = ShutdownGuard::new(signal.clone());
        signal.trigger();
        let result = signal.wait_for_drain(1, Duration::from_millis(50)).await;
        assert_eq!(
            result,
            DrainResult::Timeout {
                confirmed: 0,
                expected: 1
            }
        );
    }

    #[tokio::test]
    async fn drain_completes_once_guards_drop() {
        let signal = ShutdownSignal::new();
        let guards: Vec<_> = (0..3).map(|_| ShutdownGuard::new(signal.clone())).collect();
        signal.trigger();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait_for_drain(3, Duration::from_secs(1)).await })
        };
        drop(guards);
        assert_eq!(waiter.await.unwrap(), DrainResult::Complete(3));
        assert_eq!(signal.drained(), 3);
    }

    #[tokio::test]
    async fn scope_shutdown_waits_for_loops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut scope = TaskScope::new("test");
        for _ in 0..2 {
            let signal = scope.signal();
            let ticks = ticks.clone();
            scope.spawn(async move {
                loop {
                    tokio::select! {
                        _ = signal.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(5)) => {
                            ticks.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            });
        }
        assert_eq!(scope.len(), 2);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = scope.shutdown(Duration::from_secs(1)).await;
        assert_eq!(result, DrainResult::Complete(2));
        let after = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn cancel_now_aborts_stuck_tasks() {
        let mut scope = TaskScope::new("stuck");
        let signal = scope.signal();
        scope.spawn(async {
            std::future::pending::<()>().await;
        });
        scope.cancel_now();
        assert!(signal.is_shutting_down());
        let result = signal.wait_for_drain(1, Duration::from_secs(1)).await;
        assert!(result.is_complete());
    }
}
