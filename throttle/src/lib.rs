#![doc(issue_tracker_base_url = "https://github.com/chainbound/msg-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Shared I/O throttling: members of a named group take turns under one rate limit.

pub use throttle_common::{constants, Clock, ClockType, Direction, RealtimeClock, VirtualClock};
pub use throttle_group::*;
pub use throttle_limiter::{BucketConfig, LeakyBucket, THROTTLE_VALUE_MAX};
