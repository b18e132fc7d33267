//! The server: listeners, connection bookkeeping, sweeps, lifecycle.

mod listener;
#[allow(clippy::module_inception)]
mod server;

pub use self::server::{Builder, Server};
