//! Sealing and opening secret envelopes
//!
//! A secret is encrypted once under a random content key. The content key is
//! then sealed separately for every recipient encryption keypair using an
//! ephemeral X25519 exchange, and the whole envelope is signed by the
//! organization's signing keypair.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer};
use rand::rngs::OsRng;
use sealkeep_core::model::{EnvelopeEntry, KeyType, Keypair, KeypairId, OrgId, SecretEnvelope};
use sealkeep_core::{Error, Result};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::cipher::{self, KEY_LEN};
use crate::keys::{self, EncryptionPrivateKey, SigningPrivateKey, PUBLIC_KEY_LEN};

/// Envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

const SIGNATURE_DOMAIN: &[u8] = b"sealkeep envelope signature v1";
const SEAL_INFO: &[u8] = b"sealkeep envelope key";

/// Encrypt `secret` for every keypair in `recipients` and sign the result.
///
/// Duplicate recipients collapse to one entry. Every recipient must be an
/// active encryption keypair of `org_id`.
pub fn seal(
    org_id: OrgId,
    path: &str,
    secret: &[u8],
    recipients: &[Keypair],
    signer: &SigningPrivateKey,
) -> Result<SecretEnvelope> {
    if signer.org_id() != org_id {
        return Err(Error::InvalidRequest(format!(
            "signing keypair {} belongs to another organization",
            signer.id()
        )));
    }

    let mut unique: BTreeMap<KeypairId, PublicKey> = BTreeMap::new();
    for recipient in recipients {
        if recipient.org_id != org_id {
            return Err(Error::InvalidRecipient(format!(
                "keypair {} belongs to another organization",
                recipient.id
            )));
        }
        unique.insert(recipient.id, keys::recipient_key(recipient)?);
    }
    if unique.is_empty() {
        return Err(Error::InvalidRecipient("no recipients".to_string()));
    }

    let content_key = cipher::random_key();
    let content = cipher::encrypt(&content_key, secret, &content_aad(org_id, path))?;

    let mut entries = Vec::with_capacity(unique.len());
    for (id, public) in unique {
        entries.push(seal_key(id, &public, &content_key)?);
    }

    let mut envelope = SecretEnvelope {
        version: ENVELOPE_VERSION,
        org_id,
        path: path.to_string(),
        created_at: Utc::now(),
        content,
        entries,
        signer: signer.id(),
        signature: Vec::new(),
    };
    envelope.signature = signer.key().sign(&signing_payload(&envelope)).to_bytes().to_vec();

    Ok(envelope)
}

/// Check that `signer` may vouch for `envelope` and that the signature holds.
///
/// `signer` must be the envelope's signing keypair. Revocation is checked
/// only once the signature verifies, so a tampered envelope always reports
/// `SignatureInvalid`.
pub fn verify(envelope: &SecretEnvelope, signer: &Keypair) -> Result<()> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(Error::InvalidRequest(format!(
            "unsupported envelope version {}",
            envelope.version
        )));
    }

    if signer.id != envelope.signer
        || signer.key_type != KeyType::Signing
        || signer.org_id != envelope.org_id
    {
        return Err(Error::SignatureInvalid);
    }

    let verifying = keys::verifying_key(signer).ok_or(Error::SignatureInvalid)?;
    let signature = Signature::from_slice(&envelope.signature).map_err(|_| Error::SignatureInvalid)?;
    verifying
        .verify_strict(&signing_payload(envelope), &signature)
        .map_err(|_| Error::SignatureInvalid)?;

    if signer.revoked() {
        return Err(Error::RevokedKey(signer.id));
    }
    Ok(())
}

/// Verify `envelope` against `signer` and decrypt it with `recipient`.
///
/// Nothing is decrypted unless [`verify`] passes first.
pub fn open(
    envelope: &SecretEnvelope,
    recipient: &EncryptionPrivateKey,
    signer: &Keypair,
) -> Result<Zeroizing<Vec<u8>>> {
    verify(envelope, signer)?;

    let entry = envelope.entry_for(recipient.id()).ok_or(Error::NotAuthorized)?;
    let content_key = open_key(entry, recipient).ok_or(Error::NotAuthorized)?;

    cipher::decrypt(
        &content_key,
        &envelope.content,
        &content_aad(envelope.org_id, &envelope.path),
    )
    .ok_or(Error::NotAuthorized)
}

fn seal_key(id: KeypairId, recipient: &PublicKey, content_key: &[u8; KEY_LEN]) -> Result<EnvelopeEntry> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(Error::InvalidRecipient(format!("keypair {} has a low-order public key", id)));
    }

    let key = cipher::derive_key(
        shared.as_bytes(),
        Some(&exchange_salt(&ephemeral_public, recipient)),
        SEAL_INFO,
    )?;

    Ok(EnvelopeEntry {
        recipient: id,
        ephemeral_public: ephemeral_public.as_bytes().to_vec(),
        sealed_key: cipher::encrypt(&key, content_key, id.0.as_bytes())?,
    })
}

fn open_key(entry: &EnvelopeEntry, recipient: &EncryptionPrivateKey) -> Option<Zeroizing<[u8; KEY_LEN]>> {
    let bytes: [u8; PUBLIC_KEY_LEN] = entry.ephemeral_public.as_slice().try_into().ok()?;
    let ephemeral_public = PublicKey::from(bytes);

    let shared = recipient.secret().diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return None;
    }

    let key = cipher::derive_key(
        shared.as_bytes(),
        Some(&exchange_salt(&ephemeral_public, &recipient.public())),
        SEAL_INFO,
    )
    .ok()?;
    cipher::decrypt_key(&key, &entry.sealed_key, recipient.id().0.as_bytes())
}

fn exchange_salt(ephemeral: &PublicKey, recipient: &PublicKey) -> [u8; 2 * PUBLIC_KEY_LEN] {
    let mut salt = [0u8; 2 * PUBLIC_KEY_LEN];
    salt[..PUBLIC_KEY_LEN].copy_from_slice(ephemeral.as_bytes());
    salt[PUBLIC_KEY_LEN..].copy_from_slice(recipient.as_bytes());
    salt
}

fn content_aad(org_id: OrgId, path: &str) -> Vec<u8> {
    let mut aad = org_id.0.as_bytes().to_vec();
    aad.extend_from_slice(path.as_bytes());
    aad
}

/// Canonical bytes covered by the signature. Every variable-length field is
/// length-prefixed so no two envelopes share an encoding.
fn signing_payload(envelope: &SecretEnvelope) -> Vec<u8> {
    let mut buf = Vec::new();
    put(&mut buf, SIGNATURE_DOMAIN);
    buf.push(envelope.version);
    put(&mut buf, envelope.org_id.0.as_bytes());
    put(&mut buf, envelope.path.as_bytes());
    put(
        &mut buf,
        envelope
            .created_at
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    put(&mut buf, &envelope.content.nonce);
    put(&mut buf, &envelope.content.ciphertext);

    buf.extend_from_slice(&(envelope.entries.len() as u64).to_be_bytes());
    for entry in &envelope.entries {
        put(&mut buf, entry.recipient.0.as_bytes());
        put(&mut buf, &entry.ephemeral_public);
        put(&mut buf, &entry.sealed_key.nonce);
        put(&mut buf, &entry.sealed_key.ciphertext);
    }

    put(&mut buf, envelope.signer.0.as_bytes());
    buf
}

fn put(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(bytes);
}
