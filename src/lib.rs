//! Decoy - SSH honeypot serving each attacker a private overlay sandbox.

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

pub mod admission;
pub mod config;
pub mod error;
pub mod http_server;
pub mod mounter;
pub mod profile;
pub mod sandbox;
pub mod scp;
pub mod server;
pub mod session;
pub mod shell;
pub mod ssh;
pub mod state;
pub mod throttle;

#[cfg(test)]
mod testutil;

pub use error::{DecoyError, DecoyResult};
