//! This module contains utilities that are useful for testing code built on the message
//!  socket. They are used for testing the protocol implementation itself, but they are also
//!  exported for application testing: exercising handlers requires a registry and a
//!  recordable transport, and Rust does not provide a way to share `#[cfg(test)]`-only code
//!  with third party crates. Making the test utilities part of the crate's regular code is
//!  the compromise we picked.

pub mod message;
pub mod transport;
