//! Integration tests for NIP-04 encrypted payloads

use nostr::nip04::{decrypt, encrypt};
use nostr::{InputType, JobInput, JobRequest, Keypair};
use proptest::prelude::*;

#[test]
fn test_encrypt_decrypt_roundtrip() {
    let sender = Keypair::generate();
    let recipient = Keypair::generate();

    let payload = encrypt(sender.secret_key(), recipient.public_key(), "hello provider").unwrap();
    let plaintext = decrypt(recipient.secret_key(), sender.public_key(), &payload).unwrap();

    assert_eq!(plaintext, "hello provider");
}

#[test]
fn test_sender_can_decrypt_own_payload() {
    let sender = Keypair::generate();
    let recipient = Keypair::generate();

    let payload = encrypt(sender.secret_key(), recipient.public_key(), "both ways").unwrap();
    assert_eq!(
        decrypt(sender.secret_key(), recipient.public_key(), &payload).unwrap(),
        "both ways"
    );
}

#[test]
fn test_third_party_cannot_read_payload() {
    let sender = Keypair::generate();
    let recipient = Keypair::generate();
    let eavesdropper = Keypair::generate();

    let payload = encrypt(sender.secret_key(), recipient.public_key(), "private").unwrap();
    let attempt = decrypt(eavesdropper.secret_key(), sender.public_key(), &payload);

    assert_ne!(attempt.ok().as_deref(), Some("private"));
}

#[test]
fn test_encrypted_request_tags_roundtrip() {
    let customer = Keypair::generate();
    let provider = Keypair::generate();

    let request = JobRequest::new(5050)
        .unwrap()
        .add_input(JobInput::text("summarize my notes"))
        .add_param("model", "mistral")
        .with_bid(10_000)
        .with_correlation("corr-1");

    let plaintext = serde_json::to_string(&request.payload_tags()).unwrap();
    let payload = encrypt(customer.secret_key(), provider.public_key(), &plaintext).unwrap();
    assert!(!payload.contains("summarize"));

    let decrypted = decrypt(provider.secret_key(), customer.public_key(), &payload).unwrap();
    let tags: Vec<Vec<String>> = serde_json::from_str(&decrypted).unwrap();
    let parsed = JobRequest::from_tags(5050, &tags).unwrap();

    assert_eq!(parsed, request);
}

#[test]
fn test_unicode_and_empty_plaintext() {
    let a = Keypair::generate();
    let b = Keypair::generate();

    let long = "x".repeat(4096);
    for text in ["", "日本語 🚀", long.as_str()] {
        let payload = encrypt(a.secret_key(), b.public_key(), text).unwrap();
        assert_eq!(decrypt(b.secret_key(), a.public_key(), &payload).unwrap(), text);
    }
}

fn keypair_from(secret: [u8; 32]) -> Option<Keypair> {
    Keypair::from_secret(secret).ok()
}

fn job_input() -> impl Strategy<Value = JobInput> {
    (
        "\\PC{0,64}",
        prop_oneof![Just("text"), Just("url"), Just("event"), Just("job")],
    )
        .prop_map(|(data, kind)| match kind {
            "url" => JobInput::url(data),
            "job" => JobInput::job(data, None),
            "event" => JobInput {
                data,
                input_type: InputType::Event,
                relay: None,
                marker: None,
            },
            _ => JobInput::text(data),
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: any plaintext survives encryption to the counterparty
    #[test]
    fn prop_plaintext_roundtrip(
        sender in prop::array::uniform32(any::<u8>()),
        recipient in prop::array::uniform32(any::<u8>()),
        text in "\\PC{0,256}",
    ) {
        let (sender, recipient) = (keypair_from(sender), keypair_from(recipient));
        prop_assume!(sender.is_some() && recipient.is_some());
        let (sender, recipient) = (sender.unwrap(), recipient.unwrap());
        let payload = encrypt(sender.secret_key(), recipient.public_key(), &text).unwrap();
        prop_assert_eq!(decrypt(recipient.secret_key(), sender.public_key(), &payload).unwrap(), text);
    }

    /// Property: an encrypted request decrypts to the identical tag array
    #[test]
    fn prop_encrypted_request_tags_roundtrip(
        inputs in prop::collection::vec(job_input(), 1..4),
        params in prop::collection::vec(("[a-z_]{1,12}", "\\PC{0,40}"), 0..4),
        bid in prop::option::of(any::<u64>()),
        relays in prop::collection::vec("wss://[a-z]{1,10}\\.example", 0..3),
        correlation in "[0-9a-f]{8}-[0-9a-f]{4}",
    ) {
        let customer = Keypair::generate();
        let provider = Keypair::generate();

        let mut request = JobRequest::new(5050).unwrap().with_correlation(correlation);
        for input in inputs {
            request = request.add_input(input);
        }
        for (name, value) in params {
            request = request.add_param(name, value);
        }
        if let Some(bid) = bid {
            request = request.with_bid(bid);
        }
        for relay in relays {
            request = request.add_relay(relay);
        }

        let tags = request.payload_tags();
        let plaintext = serde_json::to_string(&tags).unwrap();
        let payload = encrypt(customer.secret_key(), provider.public_key(), &plaintext).unwrap();
        let decrypted = decrypt(provider.secret_key(), customer.public_key(), &payload).unwrap();
        let decoded: Vec<Vec<String>> = serde_json::from_str(&decrypted).unwrap();

        prop_assert_eq!(&decoded, &tags);
        prop_assert_eq!(JobRequest::from_tags(5050, &decoded).unwrap(), request);
    }
}
