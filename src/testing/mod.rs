//! Test support
//!
//! An in-process scripted broker over in-memory duplex streams, so the
//! whole engine can be exercised end-to-end without a network or an
//! external broker.

pub mod mocks;

pub use mocks::{MockBroker, MockConnector};
