use bytes::Bytes;
use rand::{thread_rng, Rng};
use trellis_core::{Body, Envelope, Frame, MessageType, PeerRecord, ENVELOPE_MAGIC, TRELLIS_VERSION};

#[test]
fn fuzz_decode_envelope_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..2048);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let _ = Envelope::decode(Bytes::from(data));
    }
}

#[test]
fn fuzz_decode_frame_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..512);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let _ = Frame::decode(Bytes::from(data));
    }
}

#[test]
fn random_mutation_of_valid_envelope_is_handled() {
    let mut rng = thread_rng();
    let envelope = Envelope::new(
        "alice",
        "bob",
        MessageType::File,
        3,
        Bytes::from_static(b"chunk-data"),
    )
    .with_chunk(0, 2);
    let encoded = envelope.encode().unwrap().to_vec();
    assert_eq!(&encoded[0..2], &ENVELOPE_MAGIC);
    assert_eq!(encoded[2], TRELLIS_VERSION);

    for _ in 0..1_000 {
        let mut mutated = encoded.clone();
        let flip_count = rng.gen_range(1..6);
        for _ in 0..flip_count {
            let idx = rng.gen_range(0..mutated.len());
            mutated[idx] ^= rng.gen::<u8>();
        }
        if let Ok(decoded) = Envelope::decode(Bytes::from(mutated)) {
            let _ = Body::from_envelope(&decoded);
        }
    }
}

#[test]
fn fuzz_peer_list_parse_never_panics() {
    let mut rng = thread_rng();
    let alphabet = b"ab@#,:.- 0123456789_\x00\xff";
    for _ in 0..5_000 {
        let len: usize = rng.gen_range(0..64);
        let raw: Vec<u8> = (0..len)
            .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
            .collect();
        let text = String::from_utf8_lossy(&raw);
        for record in PeerRecord::parse_list(&text) {
            assert!(trellis_core::record::is_valid_peer_id(&record.peer_id));
        }
    }
}
