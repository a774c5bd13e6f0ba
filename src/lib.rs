//! Pre-forking socket supervisor with graceful reload.
//!
//! The master process binds the listening sockets of every configured
//! service, forks workers that serve on them and replaces the whole worker
//! topology on reload without ever unbinding a socket whose address is
//! unchanged.
//!
//! - [`socket`] - Listening sockets keyed by transport and address
//! - [`worker`] - Worker processes of one service
//! - [`generation`] - Sockets plus worker groups for one configuration
//! - [`supervisor`] - Signal-driven lifecycle: start, reload, shutdown
//!
//! Unix only: workers are `fork`ed and share sockets by inheritance.

#[cfg(not(unix))]
compile_error!("prefork supports unix platforms only: workers are forked and inherit sockets");

pub mod config;
pub mod daemon;
pub mod error;
pub mod generation;
pub mod paths;
pub mod process;
pub mod server;
pub mod signals;
pub mod socket;
pub mod supervisor;
pub mod validate;
pub mod worker;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
