//! End-to-end envelope tests: wrap, then unwrap through the public façade.

use std::sync::Arc;

use proptest::prelude::*;
use sealwire_core::crypto::sha256;
use sealwire_core::{
    Attribute, ContentType, Context, Envelope, EnvelopeMode, EnvelopeState, Error, FaultController,
    FaultKind, Handle, Keyset, PrivateKey, PublicKey, ResourceKind, SessionKey, SigningKey, Status,
    Transform,
};

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Pop until the object has nothing more to give.
fn drain(obj: &mut impl Transform, out: &mut Vec<u8>) -> Result<(), Error> {
    let mut buf = [0u8; 1024];
    loop {
        match obj.pop(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) if err.is_recoverable() => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

fn wrap(env: &mut Envelope, data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut wire = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        match env.push(&data[pos..]) {
            Ok(n) => pos += n,
            Err(err) if err.status() == Status::Overflow => pos += err.consumed(),
            Err(err) => return Err(err),
        }
        drain(env, &mut wire)?;
    }
    loop {
        match env.flush() {
            Ok(()) => break,
            Err(err) if err.status() == Status::Overflow => drain(env, &mut wire)?,
            Err(err) => return Err(err),
        }
    }
    drain(env, &mut wire)?;
    Ok(wire)
}

/// Push `parts` one after another, answering credential requests with
/// `supply`, then flush and collect the plaintext.
fn unwrap_parts<F>(env: &mut Envelope, parts: &[&[u8]], mut supply: F) -> Result<Vec<u8>, Error>
where
    F: FnMut(&mut Envelope, ResourceKind) -> Result<(), Error>,
{
    let mut plain = Vec::new();
    for part in parts.iter().filter(|part| !part.is_empty()) {
        let mut pos = 0;
        while pos < part.len() {
            match env.push(&part[pos..]) {
                Ok(n) => pos += n,
                Err(err) if err.status() == Status::ResourceNeeded => {
                    pos += err.consumed();
                    let kind = env.required_resource().expect("suspended without a request");
                    supply(env, kind)?;
                }
                Err(err) if err.status() == Status::Overflow => pos += err.consumed(),
                Err(err) => return Err(err),
            }
            drain(env, &mut plain)?;
        }
    }
    loop {
        match env.flush() {
            Ok(()) => break,
            Err(err) if err.status() == Status::ResourceNeeded => {
                let kind = env.required_resource().expect("suspended without a request");
                supply(env, kind)?;
            }
            Err(err) if err.status() == Status::Overflow => drain(env, &mut plain)?,
            Err(err) => return Err(err),
        }
    }
    drain(env, &mut plain)?;
    Ok(plain)
}

fn no_requests(_: &mut Envelope, kind: ResourceKind) -> Result<(), Error> {
    panic!("unexpected request for {kind:?}");
}

fn session_key_wire(ctx: &Context, key: &Arc<SessionKey>, data: &[u8]) -> Vec<u8> {
    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_numeric(Attribute::SegmentSize, 256).unwrap();
    env.set_handle(Attribute::SessionKey, Handle::SessionKey(Arc::clone(key))).unwrap();
    wrap(&mut env, data).unwrap()
}

fn password_wire(ctx: &Context, passwords: &[&str], data: &[u8]) -> Vec<u8> {
    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_numeric(Attribute::KdfIterations, 1000).unwrap();
    for password in passwords {
        env.set_string(Attribute::Password, password).unwrap();
    }
    wrap(&mut env, data).unwrap()
}

#[test]
fn test_plain_definite_overhead() {
    let ctx = Context::new();
    let data = b"fifteen bytes!!";
    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_numeric(Attribute::DataSize, 15).unwrap();
    let wire = wrap(&mut env, data).unwrap();
    assert_eq!(wire.len(), 15 + 17);
    assert_eq!(&wire[..4], b"SLWE");

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    let plain = unwrap_parts(&mut env, &[&wire], no_requests).unwrap();
    assert_eq!(plain, data);
    assert_eq!(env.state(), EnvelopeState::Complete);
    assert_eq!(env.content_type(), Some(ContentType::Data));
}

#[test]
fn test_plain_indefinite_overhead() {
    let ctx = Context::new();
    let data = b"fifteen bytes!!";
    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    let wire = wrap(&mut env, data).unwrap();
    assert_eq!(wire.len(), 15 + 25);

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    assert_eq!(unwrap_parts(&mut env, &[&wire], no_requests).unwrap(), data);
}

#[test]
fn test_password_definite_overhead() {
    let ctx = Context::new();
    let data = b"fifteen bytes!!";
    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_numeric(Attribute::KdfIterations, 1000).unwrap();
    env.set_numeric(Attribute::DataSize, 15).unwrap();
    env.set_string(Attribute::Password, "open sesame").unwrap();
    assert_eq!(env.push(data).unwrap(), 15);
    env.flush().unwrap();
    let mut wire = Vec::new();
    drain(&mut env, &mut wire).unwrap();
    // header 8, cipher 11, segment 7, password 72, body length 9,
    // one segment tag 16, sealed content type 20
    assert_eq!(wire.len(), 15 + 143);

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    env.set_string(Attribute::Password, "open sesame").unwrap();
    assert_eq!(unwrap_parts(&mut env, &[&wire], no_requests).unwrap(), data);
    assert_eq!(env.content_type(), Some(ContentType::Data));
}

#[test]
fn test_flush_overflow_resumes_identically() {
    let ctx = Context::new();
    let signer = Arc::new(SigningKey::generate());
    let verify = Arc::new(signer.verify_key());
    let data = sample(4040);

    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_numeric(Attribute::DataSize, data.len() as i64).unwrap();
    env.set_handle(Attribute::SigningKey, Handle::SigningKey(Arc::clone(&signer)))
        .unwrap();
    let expected = wrap(&mut env, &data).unwrap();

    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_numeric(Attribute::SegmentSize, 2048).unwrap();
    env.set_numeric(Attribute::BufferSize, 4096).unwrap();
    env.set_numeric(Attribute::DataSize, data.len() as i64).unwrap();
    env.set_handle(Attribute::SigningKey, Handle::SigningKey(signer))
        .unwrap();
    assert_eq!(env.push(&data).unwrap(), data.len());
    let err = env.flush().unwrap_err();
    assert_eq!(err.status(), Status::Overflow);
    assert!(err.is_recoverable());
    assert_eq!(env.state(), EnvelopeState::TrailerProcessing);

    let mut wire = Vec::new();
    drain(&mut env, &mut wire).unwrap();
    env.flush().unwrap();
    drain(&mut env, &mut wire).unwrap();
    assert_eq!(env.state(), EnvelopeState::Complete);
    assert_eq!(wire, expected);

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    env.set_handle(Attribute::SignatureCheckKey, Handle::VerifyKey(verify))
        .unwrap();
    assert_eq!(unwrap_parts(&mut env, &[&wire], no_requests).unwrap(), data);
}

#[test]
fn test_declared_size_bounds() {
    let ctx = Context::new();
    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_numeric(Attribute::DataSize, 10).unwrap();
    let err = env.push(&[7u8; 11]).unwrap_err();
    assert_eq!(err.status(), Status::Overflow);
    assert_eq!(err.consumed(), 10);
    env.flush().unwrap();

    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_numeric(Attribute::DataSize, 10).unwrap();
    env.push(&[7u8; 5]).unwrap();
    assert_eq!(env.flush().unwrap_err().status(), Status::Underflow);
    env.push(&[7u8; 5]).unwrap();
    env.flush().unwrap();
}

#[test]
fn test_password_supplied_on_request() {
    let ctx = Context::new();
    let data = sample(10_000);
    let wire = password_wire(&ctx, &["correct horse"], &data);

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    let mut requests = Vec::new();
    let plain = unwrap_parts(&mut env, &[&wire], |env, kind| {
        requests.push(kind);
        env.set_string(Attribute::Password, "correct horse")
    })
    .unwrap();
    assert_eq!(plain, data);
    assert_eq!(requests, vec![ResourceKind::Password]);
    assert_eq!(env.content_type(), Some(ContentType::Data));
}

#[test]
fn test_preset_password_needs_no_request() {
    let ctx = Context::new();
    let data = sample(3000);
    let wire = password_wire(&ctx, &["hunter2"], &data);

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    env.set_string(Attribute::Password, "hunter2").unwrap();
    assert_eq!(unwrap_parts(&mut env, &[&wire], no_requests).unwrap(), data);
}

#[test]
fn test_wrong_passwords_then_correct() {
    let ctx = Context::new();
    let data = sample(1000);
    let wire = password_wire(&ctx, &["alpha", "beta", "gamma"], &data);

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    let err = env.push(&wire).unwrap_err();
    assert_eq!(err.status(), Status::ResourceNeeded);
    assert_eq!(err.consumed(), wire.len());
    assert_eq!(env.required_resource(), Some(ResourceKind::Password));

    for (attempt, wrong) in ["delta", "epsilon"].iter().enumerate() {
        let err = env.set_string(Attribute::Password, wrong).unwrap_err();
        assert_eq!(err.status(), Status::WrongKey);
        assert_eq!(env.get_numeric(Attribute::CurrentCandidate).unwrap(), attempt as i64 + 1);
        assert_eq!(
            env.state(),
            EnvelopeState::SuspendedNeedsResource(ResourceKind::Password)
        );
    }
    env.set_string(Attribute::Password, "gamma").unwrap();
    env.flush().unwrap();

    let mut plain = Vec::new();
    drain(&mut env, &mut plain).unwrap();
    assert_eq!(plain, data);
}

#[test]
fn test_excessive_iteration_count_rejected() {
    let ctx = Context::new();
    let mut wire = password_wire(&ctx, &["alpha"], &sample(100));
    let iterations = 1000u32.to_be_bytes();
    let at = wire
        .windows(iterations.len())
        .position(|window| window == iterations)
        .unwrap();
    wire[at..at + 4].copy_from_slice(&u32::MAX.to_be_bytes());

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    env.set_string(Attribute::Password, "alpha").unwrap();
    let err = env.push(&wire).unwrap_err();
    assert_eq!(err.status(), Status::BadData);
    assert_eq!(env.state(), EnvelopeState::Failed(Status::BadData));
}

#[test]
fn test_all_wrong_passwords_fail() {
    let ctx = Context::new();
    let wire = password_wire(&ctx, &["alpha", "beta", "gamma"], &sample(1000));

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    assert_eq!(env.push(&wire).unwrap_err().status(), Status::ResourceNeeded);
    for wrong in ["delta", "epsilon", "zeta"] {
        assert_eq!(
            env.set_string(Attribute::Password, wrong).unwrap_err().status(),
            Status::WrongKey
        );
    }
    assert_eq!(env.state(), EnvelopeState::Failed(Status::WrongKey));
    assert_eq!(env.flush().unwrap_err().status(), Status::WrongKey);
    assert_eq!(env.push(b"more").unwrap_err().status(), Status::WrongKey);
    assert!(env.last_error().is_some());
}

#[test]
fn test_every_split_position() {
    let ctx = Context::new();
    let key = Arc::new(SessionKey::generate());
    let data = sample(700);
    let wire = session_key_wire(&ctx, &key, &data);

    for split in 0..=wire.len() {
        let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
        env.set_handle(Attribute::SessionKey, Handle::SessionKey(Arc::clone(&key)))
            .unwrap();
        let plain = unwrap_parts(&mut env, &[&wire[..split], &wire[split..]], no_requests)
            .unwrap_or_else(|err| panic!("split at {split}: {err}"));
        assert_eq!(plain, data, "split at {split}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_random_chunking(sizes in prop::collection::vec(1usize..300, 1..40)) {
        let ctx = Context::new();
        let key = Arc::new(SessionKey::generate());
        let data = sample(2000);
        let wire = session_key_wire(&ctx, &key, &data);

        let mut parts = Vec::new();
        let mut pos = 0;
        for size in sizes.iter().cycle() {
            if pos >= wire.len() {
                break;
            }
            let end = (pos + size).min(wire.len());
            parts.push(&wire[pos..end]);
            pos = end;
        }

        let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
        env.set_handle(Attribute::SessionKey, Handle::SessionKey(Arc::clone(&key))).unwrap();
        let plain = unwrap_parts(&mut env, &parts, no_requests).unwrap();
        prop_assert_eq!(plain, data);
    }
}

#[test]
fn test_small_buffer_forces_overflow() {
    let ctx = Context::new();
    let data = sample(100_000);
    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_numeric(Attribute::BufferSize, 8192).unwrap();

    let err = env.push(&data).unwrap_err();
    assert_eq!(err.status(), Status::Overflow);
    assert!(err.consumed() > 0 && err.consumed() < data.len());

    let mut wire = Vec::new();
    drain(&mut env, &mut wire).unwrap();
    wire.extend(wrap(&mut env, &data[err.consumed()..]).unwrap());

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    env.set_numeric(Attribute::BufferSize, 8192).unwrap();
    assert_eq!(unwrap_parts(&mut env, &[&wire], no_requests).unwrap(), data);
}

#[test]
fn test_drain_is_idempotent() {
    let ctx = Context::new();
    let data = sample(500);
    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    let wire = wrap(&mut env, &data).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(env.pop(&mut buf).unwrap(), 0);
    assert_eq!(env.pop(&mut buf).unwrap(), 0);
    assert_eq!(env.push(b"late").unwrap_err().status(), Status::Complete);

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    unwrap_parts(&mut env, &[&wire], no_requests).unwrap();
    assert_eq!(env.pop(&mut buf).unwrap(), 0);
    assert_eq!(env.pop(&mut buf).unwrap(), 0);
    env.flush().unwrap();
}

#[test]
fn test_signed_content_withheld_until_verified() {
    let ctx = Context::new();
    let signer = SigningKey::generate();
    let verify = Arc::new(signer.verify_key());
    let data = sample(5000);

    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_handle(Attribute::SigningKey, Handle::SigningKey(Arc::new(signer)))
        .unwrap();
    let wire = wrap(&mut env, &data).unwrap();

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    assert_eq!(env.push(&wire).unwrap_err().status(), Status::ResourceNeeded);
    assert_eq!(env.required_resource(), Some(ResourceKind::SignatureCheckKey));
    let mut buf = [0u8; 256];
    assert_eq!(env.pop(&mut buf).unwrap_err().status(), Status::ResourceNeeded);

    env.set_handle(Attribute::SignatureCheckKey, Handle::VerifyKey(verify))
        .unwrap();
    assert_eq!(env.state(), EnvelopeState::Complete);
    let mut plain = Vec::new();
    drain(&mut env, &mut plain).unwrap();
    assert_eq!(plain, data);
}

#[test]
fn test_signature_check_key_from_keyset() {
    let ctx = Context::new();
    let signer = SigningKey::generate();
    let mut keyset = Keyset::new();
    keyset.add_verify_key(Arc::new(signer.verify_key()));
    let data = sample(2000);

    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_handle(Attribute::SigningKey, Handle::SigningKey(Arc::new(signer)))
        .unwrap();
    env.set_string(Attribute::Password, "both").unwrap();
    env.set_numeric(Attribute::KdfIterations, 1000).unwrap();
    let wire = wrap(&mut env, &data).unwrap();

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    env.set_handle(Attribute::Keyset, Handle::Keyset(Arc::new(keyset)))
        .unwrap();
    env.set_string(Attribute::Password, "both").unwrap();
    assert_eq!(unwrap_parts(&mut env, &[&wire], no_requests).unwrap(), data);
}

#[test]
fn test_detached_signature() {
    let ctx = Context::new();
    let signer = SigningKey::generate();
    let verify = Arc::new(signer.verify_key());
    let data = sample(4000);

    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_handle(Attribute::SigningKey, Handle::SigningKey(Arc::new(signer)))
        .unwrap();
    env.set_numeric(Attribute::DetachedSignature, 1).unwrap();
    let wire = wrap(&mut env, &data).unwrap();
    assert!(wire.len() < data.len());

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    env.set_handle(Attribute::SignatureCheckKey, Handle::VerifyKey(Arc::clone(&verify)))
        .unwrap();
    let mut requests = Vec::new();
    let plain = unwrap_parts(&mut env, &[&wire], |env, kind| {
        requests.push(kind);
        env.set_handle(Attribute::DetachedHash, Handle::Hash(sha256(&data)))
    })
    .unwrap();
    assert!(plain.is_empty());
    assert_eq!(requests, vec![ResourceKind::DetachedHash]);

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    env.set_handle(Attribute::SignatureCheckKey, Handle::VerifyKey(verify))
        .unwrap();
    env.set_handle(Attribute::DetachedHash, Handle::Hash(sha256(b"other content")))
        .unwrap();
    let err = unwrap_parts(&mut env, &[&wire], no_requests).unwrap_err();
    assert_eq!(err.status(), Status::Signature);
}

#[test]
fn test_public_key_recipient_via_keyset() {
    let ctx = Context::new();
    let recipient = PrivateKey::generate();
    let public = PublicKey::from_bytes(recipient.public_key().to_bytes());
    let data = sample(6000);

    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_handle(Attribute::PublicKey, Handle::PublicKey(Arc::new(public)))
        .unwrap();
    let wire = wrap(&mut env, &data).unwrap();

    let mut keyset = Keyset::new();
    keyset.add_private_key(Arc::new(recipient));
    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    env.set_handle(Attribute::Keyset, Handle::Keyset(Arc::new(keyset)))
        .unwrap();
    assert_eq!(unwrap_parts(&mut env, &[&wire], no_requests).unwrap(), data);
}

#[test]
fn test_public_key_recipient_supplied_on_request() {
    let ctx = Context::new();
    let recipient = Arc::new(PrivateKey::generate());
    let public = PublicKey::from_bytes(recipient.public_key().to_bytes());
    let data = sample(6000);

    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_handle(Attribute::PublicKey, Handle::PublicKey(Arc::new(public)))
        .unwrap();
    let wire = wrap(&mut env, &data).unwrap();

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    let plain = unwrap_parts(&mut env, &[&wire], |env, kind| {
        assert_eq!(kind, ResourceKind::PrivateKey);
        env.set_handle(Attribute::PrivateKey, Handle::PrivateKey(Arc::clone(&recipient)))
    })
    .unwrap();
    assert_eq!(plain, data);
}

#[test]
fn test_compressed_roundtrip() {
    let ctx = Context::new();
    let data = b"abc".repeat(20_000);
    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_numeric(Attribute::Compression, 1).unwrap();
    let wire = wrap(&mut env, &data).unwrap();
    assert!(wire.len() < data.len() / 10);

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    assert_eq!(unwrap_parts(&mut env, &[&wire], no_requests).unwrap(), data);
}

#[test]
fn test_corrupt_header_is_bad_data() {
    let faults = Arc::new(FaultController::new());
    let ctx = Context::new().with_faults(Arc::clone(&faults));
    faults.arm(FaultKind::CorruptHeader);
    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    let wire = wrap(&mut env, &sample(100)).unwrap();

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    let err = unwrap_parts(&mut env, &[&wire], no_requests).unwrap_err();
    assert_eq!(err.status(), Status::BadData);
    assert_eq!(env.state(), EnvelopeState::Failed(Status::BadData));
}

#[test]
fn test_corrupt_signature_fails_verification() {
    let faults = Arc::new(FaultController::new());
    let ctx = Context::new().with_faults(Arc::clone(&faults));
    let signer = SigningKey::generate();
    let verify = Arc::new(signer.verify_key());

    let mut env = ctx.create_envelope(EnvelopeMode::Wrap).unwrap();
    env.set_handle(Attribute::SigningKey, Handle::SigningKey(Arc::new(signer)))
        .unwrap();
    let wire = wrap(&mut env, &sample(3000)).unwrap();

    faults.arm(FaultKind::CorruptSignature);
    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    env.set_handle(Attribute::SignatureCheckKey, Handle::VerifyKey(verify))
        .unwrap();
    let err = unwrap_parts(&mut env, &[&wire], no_requests).unwrap_err();
    assert_eq!(err.status(), Status::Signature);

    // Withheld content is discarded with the failure.
    let mut buf = [0u8; 64];
    assert_eq!(env.pop(&mut buf).unwrap_err().status(), Status::Signature);
}

#[test]
fn test_corrupt_payload_fails_authentication() {
    let faults = Arc::new(FaultController::new());
    let ctx = Context::new().with_faults(Arc::clone(&faults));
    let key = Arc::new(SessionKey::generate());
    let wire = session_key_wire(&ctx, &key, &sample(1000));

    faults.arm(FaultKind::CorruptPayload);
    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    env.set_handle(Attribute::SessionKey, Handle::SessionKey(key)).unwrap();
    let err = unwrap_parts(&mut env, &[&wire], no_requests).unwrap_err();
    assert_eq!(err.status(), Status::Signature);
    assert!(!faults.is_armed(FaultKind::CorruptPayload));
}

#[test]
fn test_wrong_session_key_is_wrong_key() {
    let ctx = Context::new();
    let key = Arc::new(SessionKey::generate());
    let wire = session_key_wire(&ctx, &key, &sample(400));

    let mut env = ctx.create_envelope(EnvelopeMode::Unwrap).unwrap();
    assert_eq!(env.push(&wire).unwrap_err().status(), Status::ResourceNeeded);
    assert_eq!(env.required_resource(), Some(ResourceKind::SessionKey));
    let err = env
        .set_handle(Attribute::SessionKey, Handle::SessionKey(Arc::new(SessionKey::generate())))
        .unwrap_err();
    assert_eq!(err.status(), Status::WrongKey);
    assert_eq!(env.state(), EnvelopeState::Failed(Status::WrongKey));
}
