//! Logging helpers.
//!
//! - `LogThrottle` - rate limiting for repetitive failure logs
//! - `RouterLogThrottler` - the throttlers used by the transport router

pub mod throttle;

pub use throttle::{LogThrottle, RouterLogThrottler};
