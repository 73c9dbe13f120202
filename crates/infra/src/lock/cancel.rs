//! Cooperative cancellation for blocking waits.

use std::cell::Cell;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Create a connected canceller/token pair.
///
/// The token is moved to the waiting thread; the canceller stays with
/// whoever may stop the wait. Dropping every canceller also cancels.
pub fn cancellation() -> (Canceller, CancelToken) {
    let (tx, rx) = mpsc::channel();
    (
        Canceller { tx },
        CancelToken {
            rx: Some(rx),
            cancelled: Cell::new(false),
        },
    )
}

/// Sending half: requests cancellation.
#[derive(Debug, Clone)]
pub struct Canceller {
    tx: mpsc::Sender<()>,
}

impl Canceller {
    pub fn cancel(&self) {
        let _ = self.tx.send(());
    }
}

/// Receiving half, observed by the waiting thread. Once cancelled it stays cancelled.
#[derive(Debug)]
pub struct CancelToken {
    rx: Option<mpsc::Receiver<()>>,
    cancelled: Cell<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self {
            rx: None,
            cancelled: Cell::new(false),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.get() {
            return true;
        }
        let Some(rx) = &self.rx else {
            return false;
        };
        match rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => {
                self.cancelled.set(true);
                true
            }
            Err(mpsc::TryRecvError::Empty) => false,
        }
    }

    /// Wait up to `timeout`. Returns `true` as soon as cancellation is observed.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.cancelled.get() {
            return true;
        }
        let Some(rx) = &self.rx else {
            thread::sleep(timeout);
            return false;
        };
        match rx.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.cancelled.set(true);
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn wait_times_out_without_cancellation() {
        let (_canceller, token) = cancellation();
        assert!(!token.wait(Duration::from_millis(10)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_wakes_a_waiter_early() {
        let (canceller, token) = cancellation();
        let waiter = thread::spawn(move || {
            let started = Instant::now();
            let cancelled = token.wait(Duration::from_secs(10));
            (cancelled, started.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        canceller.cancel();

        let (cancelled, elapsed) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn cancellation_is_latched() {
        let (canceller, token) = cancellation();
        canceller.cancel();
        assert!(token.is_cancelled());
        assert!(token.is_cancelled());
        assert!(token.wait(Duration::from_secs(10)));
    }

    #[test]
    fn dropping_the_canceller_cancels() {
        let (canceller, token) = cancellation();
        drop(canceller);
        assert!(token.is_cancelled());
    }

    #[test]
    fn never_token_is_never_cancelled() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
        assert!(!token.wait(Duration::from_millis(1)));
    }
}
