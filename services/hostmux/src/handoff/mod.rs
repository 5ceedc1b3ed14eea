//! Handing live connections to worker processes.
//!
//! The parent keeps the shared listeners; a worker asks for ports over a
//! Unix control socket and receives each matched connection as a passed
//! descriptor together with the bytes already sniffed from it. See
//! [`control`] for the message layout and [`crate::worker`] for the worker
//! side.

pub mod control;
mod command;

pub use command::UnixCmd;
pub use control::ControlSocket;

/// Environment variable carrying the worker's control descriptor number.
pub const CONTROL_FD_ENV: &str = "HOSTMUX_CONTROL_FD";
