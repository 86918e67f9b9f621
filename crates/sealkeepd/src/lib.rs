//! sealkeepd - the sealkeep session daemon
//!
//! Holds one operator session's unlocked key material in memory and serves
//! keypair and envelope operations to local clients over the control
//! channel. Nothing outside [`session::Session::with_session`] ever touches
//! the keys.

pub mod channel;
pub mod handler;
pub mod server;
pub mod session;

pub use channel::ControlChannel;
pub use handler::{Caller, Handler};
pub use session::{Session, SessionState};
