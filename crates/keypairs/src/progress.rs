//! Progress reporting for keypair generation
//!
//! Reporters are handed to each operation by the caller. Every hook has an
//! empty default so a reporter only implements what it shows.

use sealkeep_core::model::{GenerationOutcome, KeyType, Organization};
use sealkeep_core::Error;
use tracing::{info, warn};

pub trait Progress: Send + Sync {
    /// About to list the organization's keypairs
    fn checking(&self, _org: &Organization) {}

    /// About to mint and register `key_types`
    fn generating(&self, _org: &Organization, _key_types: &[KeyType]) {}

    fn finished(&self, _org: &Organization, _outcome: &GenerationOutcome) {}

    fn failed(&self, _org: &Organization, _error: &Error) {}
}

/// Reports nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Progress for Silent {}

/// Reports through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl Progress for LogProgress {
    fn generating(&self, org: &Organization, key_types: &[KeyType]) {
        let types: Vec<&str> = key_types.iter().map(|t| t.as_str()).collect();
        info!("Generating {} keypair(s) for org {}", types.join(", "), org.name);
    }

    fn finished(&self, org: &Organization, outcome: &GenerationOutcome) {
        match outcome {
            GenerationOutcome::AlreadyComplete => info!("Org {} already has keypairs", org.name),
            GenerationOutcome::Generated { .. } => info!("Keypairs generated for org {}", org.name),
        }
    }

    fn failed(&self, org: &Organization, error: &Error) {
        warn!("Keypair generation for org {} failed: {}", org.name, error);
    }
}
