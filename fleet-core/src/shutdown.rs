//! Cooperative cancellation shared by every task in the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

struct Inner {
    flag: AtomicBool,
    notify: Notify,
    parent: Option<Arc<Inner>>,
}

impl Inner {
    fn triggered(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.triggered())
    }
}

/// Cancellation signal rooted at the process and derivable per trader.
///
/// Triggering a child cancels that child only; triggering the root is
/// observed by every derived signal.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    /// Fresh root signal wired to SIGINT and, on unix, SIGTERM.
    #[must_use]
    pub fn new() -> Self {
        let signal = Self::detached();
        let inner = signal.inner.clone();
        tokio::spawn(async move {
            wait_for_termination().await;
            inner.flag.store(true, Ordering::SeqCst);
            inner.notify.notify_waiters();
        });
        signal
    }

    /// Root signal without any OS hook, for tests and embedded runs.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
                parent: None,
            }),
        }
    }

    /// Derive a signal that fires when either this signal or the child's own
    /// trigger fires.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn triggered(&self) -> bool {
        self.inner.triggered()
    }

    /// Suspend until the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        loop {
            // Arm the notified futures before re-checking the flag so a
            // trigger between the check and the await cannot be missed.
            let own = self.inner.notify.notified();
            tokio::pin!(own);
            own.as_mut().enable();

            match &self.inner.parent {
                Some(parent) => {
                    let upstream = parent.notify.notified();
                    tokio::pin!(upstream);
                    upstream.as_mut().enable();
                    if self.triggered() {
                        return;
                    }
                    tokio::select! {
                        _ = own => {}
                        _ = upstream => {}
                    }
                }
                None => {
                    if self.triggered() {
                        return;
                    }
                    own.await;
                }
            }
            if self.triggered() {
                return;
            }
        }
    }

    /// Sleep for `duration` unless the signal fires first. Returns `true`
    /// when the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::detached()
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
