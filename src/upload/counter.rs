//! In-flight write counter with zero detection.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// Counts file writes that have started but not resolved.
///
/// Guarded by a mutex so increments and decrements may come from any task.
#[derive(Debug, Default)]
pub struct PendingWriteCounter {
    inner: Mutex<CounterInner>,
}

#[derive(Debug, Default)]
struct CounterInner {
    value: usize,
    waiter: Option<oneshot::Sender<()>>,
}

impl PendingWriteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.value += 1;
    }

    /// Decrement the count, waking the registered zero waiter if the count
    /// reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero.
    pub fn decrement(&self) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        assert!(
            inner.value > 0,
            "pending write counter decremented below zero"
        );
        inner.value -= 1;
        if inner.value == 0 {
            if let Some(waiter) = inner.waiter.take() {
                let _ = waiter.send(());
            }
        }
    }

    pub fn value(&self) -> usize {
        self.inner.lock().expect("mutex poisoned").value
    }

    pub fn is_zero(&self) -> bool {
        self.value() == 0
    }

    /// Resolve once the count is zero: immediately if it already is,
    /// otherwise the next time a decrement brings it to zero.
    ///
    /// # Panics
    ///
    /// Panics if another registration is still waiting.
    pub fn once_zero(&self) -> ZeroSignal {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if inner.value == 0 {
            let _ = tx.send(());
        } else {
            let outstanding = inner.waiter.as_ref().is_some_and(|w| !w.is_closed());
            assert!(!outstanding, "pending write counter already has a zero waiter");
            inner.waiter = Some(tx);
        }
        ZeroSignal { rx }
    }
}

/// Future returned by [`PendingWriteCounter::once_zero`].
#[derive(Debug)]
pub struct ZeroSignal {
    rx: oneshot::Receiver<()>,
}

impl Future for ZeroSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // A dropped counter can never reach zero again; treat it as drained.
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}
