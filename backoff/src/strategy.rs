//! Backoff strategies. Each one is an iterator of pauses between attempts.

pub mod exponential;
