//! NIP-01: events, canonical serialization, Schnorr signing and verification.
//!
//! Every job request, result and feedback message travels as an [`Event`].
//! The event id is the sha256 of `[0, pubkey, created_at, kind, tags, content]`
//! and the signature is a BIP-340 Schnorr signature over that id.

use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Message, SecretKey, XOnlyPublicKey, schnorr};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while building, signing or checking events.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("verification error: {0}")]
    Verification(String),

    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded x-only public key of the author
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Tags, each an array of strings whose first element is the tag name
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex Schnorr signature
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// Whether any tag is named `name`.
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags
            .iter()
            .any(|tag| tag.first().map(String::as_str) == Some(name))
    }

    /// Whether the event carries `["e", event_id, ...]`.
    pub fn references_event(&self, event_id: &str) -> bool {
        self.tags.iter().any(|tag| {
            tag.first().map(String::as_str) == Some("e")
                && tag.get(1).map(String::as_str) == Some(event_id)
        })
    }
}

/// An event that has an author but no id or signature yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// An event body without author; the pubkey comes from the signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Tags
    pub tags: Vec<Vec<String>>,
    /// Content
    pub content: String,
}

impl EventTemplate {
    /// Template stamped with the current time.
    pub fn now(kind: u16, tags: Vec<Vec<String>>, content: impl Into<String>) -> Self {
        Self {
            created_at: unix_now(),
            kind,
            tags,
            content: content.into(),
        }
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A secp256k1 secret key together with its x-only public key in hex.
///
/// Requesters normally create one per job so that requests cannot be linked
/// to each other.
#[derive(Clone, PartialEq, Eq)]
pub struct Keypair {
    secret: [u8; 32],
    public_hex: String,
}

impl Keypair {
    /// Fresh random keypair.
    pub fn generate() -> Self {
        loop {
            let secret = generate_secret_key();
            if let Ok(keypair) = Self::from_secret(secret) {
                return keypair;
            }
        }
    }

    /// Keypair for an existing secret key.
    pub fn from_secret(secret: [u8; 32]) -> Result<Self, Nip01Error> {
        let public_hex = get_public_key_hex(&secret)?;
        Ok(Self { secret, public_hex })
    }

    /// Keypair from a 64-char hex secret.
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, Nip01Error> {
        let bytes =
            hex::decode(secret_hex).map_err(|e| Nip01Error::InvalidSecretKey(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Nip01Error::InvalidSecretKey("expected 32 bytes".to_string()))?;
        Self::from_secret(secret)
    }

    pub fn secret_key(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn public_key(&self) -> &str {
        &self.public_hex
    }

    /// Sign a template with this keypair.
    pub fn sign(&self, template: &EventTemplate) -> Result<Event, Nip01Error> {
        finalize_event(template, &self.secret)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_hex)
            .finish_non_exhaustive()
    }
}

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Get the x-only public key (32 bytes) for a secret key.
pub fn get_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32], Nip01Error> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| Nip01Error::InvalidSecretKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(xonly.serialize())
}

/// Hex form of [`get_public_key`].
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, Nip01Error> {
    Ok(hex::encode(get_public_key(secret_key)?))
}

/// Whether `value` is 64 lowercase hex characters (event ids and pubkeys).
pub fn is_hex_key(value: &str) -> bool {
    value.len() == 64
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Canonical serialization used for hashing.
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    if !validate_unsigned_event(event) {
        return Err(Nip01Error::InvalidEvent(
            "pubkey must be 64 lowercase hex characters".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

/// Event id for an unsigned event.
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    let serialized = serialize_event(event)?;
    let hash = sha256::Hash::hash(serialized.as_bytes());
    Ok(hex::encode(hash.as_byte_array()))
}

pub fn validate_unsigned_event(event: &UnsignedEvent) -> bool {
    is_hex_key(&event.pubkey)
}

/// Structural check of a signed event (does not verify the signature).
pub fn validate_event(event: &Event) -> bool {
    is_hex_key(&event.id)
        && is_hex_key(&event.pubkey)
        && event.sig.len() == 128
        && event.sig.chars().all(|c| c.is_ascii_hexdigit())
}

/// Sign a template, producing a complete event.
pub fn finalize_event(
    template: &EventTemplate,
    secret_key: &[u8; 32],
) -> Result<Event, Nip01Error> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key).map_err(|e| Nip01Error::Signing(e.to_string()))?;
    let (xonly_pk, _parity) = sk.x_only_public_key(&secp);

    let unsigned = UnsignedEvent {
        pubkey: hex::encode(xonly_pk.serialize()),
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };
    let id = get_event_hash(&unsigned)?;

    let id_bytes =
        hex::decode(&id).map_err(|e| Nip01Error::Signing(format!("invalid id hex: {}", e)))?;
    let message = Message::from_digest_slice(&id_bytes)
        .map_err(|e| Nip01Error::Signing(format!("invalid message: {}", e)))?;
    let keypair = bitcoin::secp256k1::Keypair::from_secret_key(&secp, &sk);
    let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);

    Ok(Event {
        id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: hex::encode(sig.serialize()),
    })
}

/// Verify id and signature. Structural problems return `Ok(false)`.
pub fn verify_event(event: &Event) -> Result<bool, Nip01Error> {
    if !validate_event(event) {
        return Ok(false);
    }

    let unsigned = UnsignedEvent {
        pubkey: event.pubkey.clone(),
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };
    if get_event_hash(&unsigned)? != event.id {
        return Ok(false);
    }

    let secp = Secp256k1::verification_only();
    let id_bytes = hex::decode(&event.id)
        .map_err(|e| Nip01Error::Verification(format!("invalid id hex: {}", e)))?;
    let message = Message::from_digest_slice(&id_bytes)
        .map_err(|e| Nip01Error::Verification(format!("invalid message: {}", e)))?;
    let sig_bytes = hex::decode(&event.sig)
        .map_err(|e| Nip01Error::Verification(format!("invalid sig hex: {}", e)))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| Nip01Error::Verification(format!("invalid signature: {}", e)))?;
    let pubkey_bytes = hex::decode(&event.pubkey)
        .map_err(|e| Nip01Error::Verification(format!("invalid pubkey hex: {}", e)))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| Nip01Error::InvalidPublicKey(e.to_string()))?;

    Ok(secp.verify_schnorr(&sig, &message, &pubkey).is_ok())
}

/// Newest first; ties broken by lowest id.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PRIVATE_KEY: &str =
        "d217c1ff2f8a65c3e3a1740db3b9f58b8c848bb45e26d00ed4714e4a0f4ceecf";

    fn test_keypair() -> Keypair {
        Keypair::from_secret_hex(TEST_PRIVATE_KEY).unwrap()
    }

    fn note(content: &str) -> EventTemplate {
        EventTemplate {
            created_at: 1617932115,
            kind: 5050,
            tags: vec![vec!["i".to_string(), "hi".to_string(), "text".to_string()]],
            content: content.to_string(),
        }
    }

    // =========================================================================
    // Keys
    // =========================================================================

    #[test]
    fn test_generated_keypairs_are_distinct() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.public_key(), b.public_key());
        assert!(is_hex_key(a.public_key()));
    }

    #[test]
    fn test_keypair_from_secret_hex_is_deterministic() {
        let a = test_keypair();
        let b = test_keypair();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(
            a.public_key(),
            get_public_key_hex(a.secret_key()).unwrap()
        );
    }

    #[test]
    fn test_keypair_rejects_bad_secret() {
        assert!(Keypair::from_secret_hex("zz").is_err());
        assert!(Keypair::from_secret_hex("abcd").is_err());
        assert!(Keypair::from_secret([0u8; 32]).is_err());
    }

    #[test]
    fn test_keypair_debug_hides_secret() {
        let kp = test_keypair();
        let debug = format!("{:?}", kp);
        assert!(!debug.contains(TEST_PRIVATE_KEY));
        assert!(debug.contains(kp.public_key()));
    }

    // =========================================================================
    // Serialization and signing
    // =========================================================================

    #[test]
    fn test_serialize_event_canonical_form() {
        let kp = test_keypair();
        let unsigned = UnsignedEvent {
            pubkey: kp.public_key().to_string(),
            created_at: 1617932115,
            kind: 1,
            tags: vec![],
            content: "Hello, world!".to_string(),
        };

        let expected = format!(
            "[0,\"{}\",1617932115,1,[],\"Hello, world!\"]",
            kp.public_key()
        );
        assert_eq!(serialize_event(&unsigned).unwrap(), expected);
    }

    #[test]
    fn test_serialize_rejects_uppercase_pubkey() {
        let unsigned = UnsignedEvent {
            pubkey: test_keypair().public_key().to_uppercase(),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
        };
        assert!(serialize_event(&unsigned).is_err());
    }

    #[test]
    fn test_signed_event_verifies() {
        let kp = test_keypair();
        let event = kp.sign(&note("job")).unwrap();
        assert_eq!(event.pubkey, kp.public_key());
        assert_eq!(event.sig.len(), 128);
        assert!(verify_event(&event).unwrap());
    }

    #[test]
    fn test_same_template_same_id() {
        let kp = test_keypair();
        let a = kp.sign(&note("x")).unwrap();
        let b = kp.sign(&note("x")).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_tampered_content_fails_verification() {
        let mut event = test_keypair().sign(&note("original")).unwrap();
        event.content = "forged".to_string();
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_swapped_pubkey_fails_verification() {
        let mut event = test_keypair().sign(&note("original")).unwrap();
        event.pubkey = Keypair::generate().public_key().to_string();
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_malformed_event_is_not_valid() {
        let mut event = test_keypair().sign(&note("x")).unwrap();
        event.sig = "00".to_string();
        assert!(!validate_event(&event));
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_unicode_content_roundtrips_through_json() {
        let event = test_keypair().sign(&note("Hello 世界 \"q\"\n")).unwrap();
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
        assert!(verify_event(&back).unwrap());
    }

    // =========================================================================
    // Tag helpers and ordering
    // =========================================================================

    #[test]
    fn test_tag_helpers() {
        let mut template = note("x");
        template.tags.push(vec!["e".to_string(), "a".repeat(64)]);
        template.tags.push(vec!["encrypted".to_string()]);
        let event = test_keypair().sign(&template).unwrap();

        assert_eq!(event.tag_value("i"), Some("hi"));
        assert!(event.has_tag("encrypted"));
        assert!(event.references_event(&"a".repeat(64)));
        assert!(!event.references_event(&"b".repeat(64)));
        assert_eq!(event.tag_value("missing"), None);
    }

    #[test]
    fn test_sort_events_newest_first_then_lowest_id() {
        let base = Event {
            id: String::new(),
            pubkey: "a".repeat(64),
            created_at: 0,
            kind: 6050,
            tags: vec![],
            content: String::new(),
            sig: "a".repeat(128),
        };
        let mut events = vec![
            Event { id: "abc123".into(), created_at: 1610000000, ..base.clone() },
            Event { id: "abc125".into(), created_at: 1620000000, ..base.clone() },
            Event { id: "abc124".into(), created_at: 1620000000, ..base },
        ];

        sort_events(&mut events);

        assert_eq!(events[0].id, "abc124");
        assert_eq!(events[1].id, "abc125");
        assert_eq!(events[2].id, "abc123");
    }
}
