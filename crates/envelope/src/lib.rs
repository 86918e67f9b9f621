//! envelope - secret envelopes for sealkeep
//!
//! Seal a secret for a set of organization encryption keypairs, sign it with
//! the organization's signing keypair, and open it again as one of the
//! recipients. Also owns password derivation and the account master key that
//! wraps every organization private key.

mod cipher;
pub mod keys;
pub mod master;
pub mod seal;

pub use keys::{mint, EncryptionPrivateKey, SigningPrivateKey};
pub use master::{enroll, Enrollment, MasterKey, PasswordKey};
pub use seal::{open, seal, verify, ENVELOPE_VERSION};
