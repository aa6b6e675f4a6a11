//! IPC bridge between the host and a script worker.
//!
//! # Architecture
//!
//! - **codec**: length-prefixed JSON framing with a payload size limit
//! - **channel**: typed, ordered endpoints over any AsyncRead/AsyncWrite pair
//! - **protocol**: Command and Response vocabulary plus the `init` handshake

pub mod channel;
pub mod codec;
pub mod protocol;
