use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Sleep, sleep};

use crate::{Condition, Operation};

/// What the retry is currently waiting on: the operation itself, or the pause before the next
/// attempt.
///
/// ```no_rust
///   Attempt --Ok--------------------------------> Ready(Ok)
///      |----Err, condition says no--------------> Ready(Err)
///      |----Err, retryable, strategy exhausted--> Ready(Err)
///      '----Err, retryable, pause p-------------> Pause(p) --elapsed--> Attempt
/// ```
#[pin_project(project = PhaseProj)]
enum Phase<F> {
    Attempt(#[pin] F),
    Pause(#[pin] Sleep),
}

/// Future that drives an [`Operation`] until it succeeds, fails with an error the
/// [`Condition`] rejects, or the backoff strategy runs dry. In the last two cases the most recent
/// error is returned.
#[pin_project]
pub struct Retry<S, O, C>
where
    O: Operation,
{
    #[pin]
    phase: Phase<O::Future>,
    strategy: S,
    operation: O,
    condition: C,
    attempts: usize,
}

impl<S, O, C> Retry<S, O, C>
where
    S: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<IS>(strategy: IS, mut operation: O, condition: C) -> Self
    where
        IS: IntoIterator<IntoIter = S, Item = Duration>,
    {
        let first = operation.run();
        Self {
            phase: Phase::Attempt(first),
            strategy: strategy.into_iter(),
            operation,
            condition,
            attempts: 1,
        }
    }

    /// Attempts started so far, the first one included.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

impl<S, O, C> Future for Retry<S, O, C>
where
    S: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            let next = match this.phase.as_mut().project() {
                PhaseProj::Attempt(fut) => match fut.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                    Poll::Ready(Err(err)) => {
                        if !this.condition.can_retry(&err) {
                            return Poll::Ready(Err(err));
                        }
                        match this.strategy.next() {
                            None => return Poll::Ready(Err(err)),
                            Some(pause) => Phase::Pause(sleep(pause)),
                        }
                    }
                },
                PhaseProj::Pause(pause) => match pause.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => {
                        *this.attempts += 1;
                        Phase::Attempt(this.operation.run())
                    }
                },
            };
            this.phase.set(next);
        }
    }
}
