//! In-process event distribution.
//!
//! [`bus::EventBus`] fans every [`bus::PlatformEvent`] out to all
//! subscribers; [`sinks::SinkRegistry`] routes events to subscribers
//! interested in one scope (e.g. a single job group).

pub mod bus;
pub mod sinks;

pub use bus::{EventBus, PlatformEvent};
pub use sinks::SinkRegistry;
