//! Model stream implementations. The runner depends only on the abstract
//! `ModelStream` trait in skiff-core; this crate provides the scripted mock
//! used by tests and the unconfigured fallback the binary starts with when
//! no provider credentials are present.

pub mod mock;
pub mod unconfigured;

pub use mock::{MockScript, MockStream};
pub use unconfigured::UnconfiguredStream;
