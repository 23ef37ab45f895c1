//! Deadlines over operations that outlive a single wait.
//!
//! A [`PendingOp`] owns one in-flight future (typically a socket read) and
//! can be waited on repeatedly, each time with a fresh deadline. When a
//! deadline fires the operation is *not* cancelled: it moves to
//! [`Phase::TimedOut`] and the next [`PendingOp::arm`] picks it up again, so
//! the eventual result is delivered to whichever wait is active when it
//! completes.
//!
//! ```text
//!            arm() + deadline             arm() + inner ready
//!  Pending ─────────────────────► TimedOut ─────────────────────► Resolved
//!     │                             ▲   │
//!     │                             └───┘ arm() + deadline
//!     └──────────────────────────────────────────────────────────► Resolved
//!                     arm() + inner ready
//! ```
//!
//! Only one wait can be armed at a time: [`Armed`] mutably borrows the
//! operation, so a new wait replaces the previous one rather than stacking.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::time::Sleep;

/// Deadlines shorter than this are rounded up to avoid busy polling.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(100);

/// The deadline of an [`Armed`] wait elapsed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline elapsed")]
pub struct Elapsed;

/// Lifecycle of a [`PendingOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Never waited on, or waited on without a deadline firing.
    Pending,
    /// A deadline fired; the inner operation is still live.
    TimedOut,
    /// The inner result has been delivered.
    Resolved,
}

enum OpState<F> {
    Pending(Pin<Box<F>>),
    TimedOut(Pin<Box<F>>),
    Resolved,
}

/// An in-flight operation that can be waited on more than once.
pub struct PendingOp<F: Future> {
    state: OpState<F>,
}

impl<F: Future> std::fmt::Debug for PendingOp<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOp")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl<F: Future> PendingOp<F> {
    /// Take ownership of `future`. Nothing is polled until the first wait.
    pub fn new(future: F) -> Self {
        Self {
            state: OpState::Pending(Box::pin(future)),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        match self.state {
            OpState::Pending(_) => Phase::Pending,
            OpState::TimedOut(_) => Phase::TimedOut,
            OpState::Resolved => Phase::Resolved,
        }
    }

    /// Start a wait bounded by `timeout` (no bound when `None`).
    ///
    /// Returns `None` once the result has already been delivered.
    pub fn arm(&mut self, timeout: Option<Duration>) -> Option<Armed<'_, F>> {
        if matches!(self.state, OpState::Resolved) {
            return None;
        }
        let sleep = timeout.map(|t| Box::pin(tokio::time::sleep(clamp_timeout(t))));
        Some(Armed {
            op: self,
            sleep,
            done: false,
        })
    }

    /// Poll the operation once without waiting.
    ///
    /// Yields the result (and resolves the operation) only if it is
    /// already complete.
    pub fn now_or_never(&mut self) -> Option<F::Output> {
        let fut = match &mut self.state {
            OpState::Pending(fut) | OpState::TimedOut(fut) => fut,
            OpState::Resolved => return None,
        };
        let out = fut.as_mut().now_or_never()?;
        self.state = OpState::Resolved;
        Some(out)
    }

    fn mark_timed_out(&mut self) {
        let state = std::mem::replace(&mut self.state, OpState::Resolved);
        self.state = match state {
            OpState::Pending(fut) => OpState::TimedOut(fut),
            other => other,
        };
    }
}

/// One bounded wait on a [`PendingOp`].
///
/// Resolves with the inner output if the operation completes first,
/// otherwise with [`Elapsed`] when the deadline fires.
pub struct Armed<'a, F: Future> {
    op: &'a mut PendingOp<F>,
    sleep: Option<Pin<Box<Sleep>>>,
    done: bool,
}

impl<F: Future> std::fmt::Debug for Armed<'_, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Armed")
            .field("op", &self.op)
            .field("has_deadline", &self.sleep.is_some())
            .finish()
    }
}

impl<F: Future> Future for Armed<'_, F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(!this.done, "Armed polled after completion");

        let fut = match &mut this.op.state {
            OpState::Pending(fut) | OpState::TimedOut(fut) => fut,
            OpState::Resolved => unreachable!("arm() refuses resolved operations"),
        };

        // Inner completion wins over a deadline that fires in the same tick.
        if let Poll::Ready(out) = fut.as_mut().poll(cx) {
            this.op.state = OpState::Resolved;
            this.sleep = None;
            this.done = true;
            return Poll::Ready(Ok(out));
        }

        if let Some(sleep) = this.sleep.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                this.sleep = None;
                this.done = true;
                this.op.mark_timed_out();
                return Poll::Ready(Err(Elapsed));
            }
        }

        Poll::Pending
    }
}

/// Bound a one-shot future by `timeout` (unbounded when `None`).
pub async fn with_timeout<F: Future>(future: F, timeout: Option<Duration>) -> Result<F::Output, Elapsed> {
    match timeout {
        Some(t) => tokio::time::timeout(clamp_timeout(t), future)
            .await
            .map_err(|_elapsed| Elapsed),
        None => Ok(future.await),
    }
}

/// Apply the [`MIN_TIMEOUT`] floor.
pub fn clamp_timeout(timeout: Duration) -> Duration {
    timeout.max(MIN_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test(start_paused = true)]
    async fn test_inner_result_wins_before_deadline() {
        let mut op = PendingOp::new(async { 5 });
        assert_eq!(op.phase(), Phase::Pending);
        let out = op.arm(Some(Duration::from_secs(1))).unwrap().await;
        assert_eq!(out, Ok(5));
        assert_eq!(op.phase(), Phase::Resolved);
        assert!(op.arm(None).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearmed_wait_receives_late_result() {
        let (tx, rx) = oneshot::channel::<&'static str>();
        let mut op = PendingOp::new(rx);

        let first = op.arm(Some(Duration::from_millis(200))).unwrap().await;
        assert_eq!(first, Err(Elapsed));
        assert_eq!(op.phase(), Phase::TimedOut);

        // Completes after the first wait gave up.
        tx.send("late").unwrap();

        let second = op.arm(Some(Duration::from_millis(200))).unwrap().await;
        assert_eq!(second.unwrap().unwrap(), "late");
        assert_eq!(op.phase(), Phase::Resolved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_arriving_during_second_wait() {
        let (tx, rx) = oneshot::channel::<u32>();
        let mut op = PendingOp::new(rx);

        assert!(op.arm(Some(Duration::from_millis(100))).unwrap().await.is_err());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = tx.send(9);
        });

        let out = op.arm(Some(Duration::from_secs(1))).unwrap().await;
        assert_eq!(out.unwrap().unwrap(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_deadline_is_clamped() {
        let start = tokio::time::Instant::now();
        let mut op = PendingOp::new(std::future::pending::<()>());
        assert_eq!(op.arm(Some(Duration::from_millis(1))).unwrap().await, Err(Elapsed));
        assert!(start.elapsed() >= MIN_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_now_or_never() {
        let (tx, rx) = oneshot::channel::<u8>();
        let mut op = PendingOp::new(rx);
        assert!(op.now_or_never().is_none());
        assert_eq!(op.phase(), Phase::Pending);

        tx.send(3).unwrap();
        assert_eq!(op.now_or_never().unwrap().unwrap(), 3);
        assert_eq!(op.phase(), Phase::Resolved);
        assert!(op.now_or_never().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_one_shot() {
        assert_eq!(with_timeout(async { 1 }, Some(Duration::from_secs(1))).await, Ok(1));
        assert_eq!(
            with_timeout(std::future::pending::<()>(), Some(Duration::from_millis(500))).await,
            Err(Elapsed)
        );
        assert_eq!(with_timeout(async { 2 }, None).await, Ok(2));
    }
}
