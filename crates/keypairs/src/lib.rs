//! keypairs - organization keypair lifecycle for sealkeep
//!
//! Lists, generates and revokes the signing and encryption keypairs each
//! organization needs, through the registry collaborator.

pub mod locks;
pub mod manager;
pub mod presence;
pub mod progress;

pub use manager::{KeyMinter, KeypairManager};
pub use presence::{active_of, KeyPresence};
pub use progress::{LogProgress, Progress, Silent};
