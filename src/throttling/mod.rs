//! Request Throttling
//!
//! Token-bucket quotas per user, per group and per client address,
//! applied by the [`ThrottlingGate`] in front of the cache handler.

pub mod bucket;
pub mod gate;

pub use bucket::{Bucket, BucketManager, Quota};
pub use gate::{BucketThrottler, NoopThrottler, ThrottleDecision, Throttler, ThrottlingGate};
