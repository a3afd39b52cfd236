pub mod domain;
pub mod buckets;
pub mod store;
pub mod ingest;
pub mod aggregate;
pub mod consumer;
pub mod scheduler;
pub mod stream;
pub mod config;
pub mod observability;
pub mod signals;

#[cfg(test)]
pub(crate) mod testutil;

pub use buckets::{BucketClock, Granularity};
pub use domain::RealtimeSample;
