//! Retry an async [`Operation`] with a pluggable backoff [`strategy`].
//!
//! A strategy is any `Iterator<Item = Duration>`; every item is the pause before the next
//! attempt and exhausting the iterator ends the retries. The [`Condition`] decides which errors
//! are worth another attempt, everything else is returned right away.

use std::future::Future;

pub mod retry;
pub mod strategy;

/// Something that can be (re)started to produce a fresh future on every attempt.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    fn run(&mut self) -> Self::Future;
}

impl<T, E, Fut, F> Operation for F
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    type Item = T;
    type Error = E;
    type Future = Fut;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether an error is retryable.
pub trait Condition<E> {
    fn can_retry(&self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: Fn(&E) -> bool,
{
    fn can_retry(&self, error: &E) -> bool {
        self(error)
    }
}
