//! An in-memory adapter for exercising a [`Session`](crate::Session)
//! without any radio
//!
//! [`SessionConfig::start_fake`](crate::SessionConfig::start_fake) returns a
//! [`FakeAdapter`] alongside the session. The adapter records every command
//! the session issues and lets the caller play the part of the hardware by
//! emitting [`BackendEvent`](crate::BackendEvent)s.

mod session;
pub use session::{FakeAdapter, FakeBackend, FakeCommand};
