//! Process-wide tracing setup shared by the eventide binaries.

pub mod tracing;

pub use self::tracing::{LogFormat, init, init_with};
