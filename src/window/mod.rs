//! Fixed-length time bucketing and the time source used to drive it.

pub mod clock;

pub use self::clock::{BucketClock, BucketId, Clock, ManualClock, SystemClock};
