//! Cooperative run interruption (Ctrl-C).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Shared interrupt flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    triggered: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// An interrupt triggered by the first Ctrl-C the process receives.
    ///
    /// A second Ctrl-C exits the process with status 130 without waiting for
    /// the current step. Must be called inside a tokio runtime.
    pub fn on_ctrl_c() -> Self {
        let interrupt = Self::new();
        let handle = interrupt.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if handle.trigger() {
                    tracing::warn!("interrupt received; stopping after the current step");
                } else {
                    tracing::warn!("second interrupt received; exiting now");
                    std::process::exit(130);
                }
            }
        });
        interrupt
    }

    /// Set the flag and wake waiters. Returns `false` if it was already set.
    pub fn trigger(&self) -> bool {
        let first = !self.inner.triggered.swap(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once [`Interrupt::trigger`] has been called.
    pub async fn triggered(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_waiter() {
        let interrupt = Interrupt::new();
        let waiter = interrupt.clone();
        let task = tokio::spawn(async move { waiter.triggered().await });

        tokio::task::yield_now().await;
        interrupt.trigger();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(interrupt.is_triggered());
    }

    #[test]
    fn test_only_first_trigger_reports_first() {
        let interrupt = Interrupt::new();
        let clone = interrupt.clone();
        assert!(interrupt.trigger());
        assert!(!clone.trigger());
        assert!(!interrupt.trigger());
        assert!(clone.is_triggered());
    }

    #[tokio::test]
    async fn test_already_triggered_returns_immediately() {
        let interrupt = Interrupt::new();
        interrupt.trigger();
        interrupt.triggered().await;
    }
}
