//! Control protocol server.
//!
//! Translates the TCP text protocol into scheduler operations: parse the
//! request, forward it to the scheduler loop, wait a bounded time for the
//! response, write it back, close. Concurrent connections are capped by a
//! semaphore instead of spawning unboundedly.

pub mod connection;
pub mod proto;

pub use connection::serve_control;
