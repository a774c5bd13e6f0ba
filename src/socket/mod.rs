//! Listening sockets and their reuse across generations.
//!
//! A [`SocketRegistry`] belongs to exactly one generation. When a new
//! generation is built, each socket whose [`SocketKey`] is unchanged is moved
//! out of the old registry instead of being rebound, which is what keeps the
//! port open during a graceful reload.
//!
//! ## Module Structure
//!
//! - [`key`]: transport and address identity
//! - [`handle`]: owned bound socket
//! - [`registry`]: per-generation map with claim/close semantics

mod handle;
mod key;
mod registry;

#[cfg(test)]
mod tests;

pub use handle::SocketHandle;
pub use key::{ListenAddr, SocketKey, Transport};
pub use registry::{DEFAULT_BACKLOG, SocketRegistry};
