//! Property tests for the frame codec and stream decoder.

use proptest::prelude::*;

use logship::error::FrameError;
use logship::identity::{Identity, OsKind};
use logship::protocol::{frame, Event, LogLevel, Message, StreamDecoder, HEADER_SIZE};

fn arb_level() -> impl Strategy<Value = LogLevel> {
    (1u32..=5).prop_map(LogLevel::from_numeric)
}

fn arb_event() -> impl Strategy<Value = Event> {
    (
        "[ -~]{0,80}",
        "[ -~]{0,40}",
        "[0-9T:+-]{0,25}",
        "[A-Za-z-]{1,30}",
        arb_level(),
        any::<u64>(),
    )
        .prop_map(|(xml, format, timestamp, provider, level, record_id)| Event {
            xml,
            format,
            timestamp,
            provider,
            level,
            record_id,
        })
}

fn arb_sender() -> impl Strategy<Value = Identity> {
    (
        "[a-z0-9-]{1,16}",
        prop_oneof![Just(OsKind::Windows), Just(OsKind::Linux), Just(OsKind::Other)],
        "[ -~]{0,20}",
        "[0-9a-f]{8,64}",
    )
        .prop_map(|(name, os, version, machine)| Identity::new(name, os, version, machine))
}

fn arb_message() -> impl Strategy<Value = Message> {
    (arb_sender(), 0usize..6).prop_flat_map(|(sender, kind)| {
        let s = sender.clone();
        match kind {
            0 => Just(Message::connect(&s)).boxed(),
            1 => Just(Message::query_last_event(&s)).boxed(),
            2 => any::<u64>()
                .prop_map(move |id| Message::return_last_event(&s, id))
                .boxed(),
            3 => any::<u64>()
                .prop_map(move |id| Message::accept_last_event(&s, id))
                .boxed(),
            4 => ("[ -~]{0,40}", 0i32..i32::MAX)
                .prop_map(move |(reason, id)| Message::refuse(&s, id, reason))
                .boxed(),
            _ => (prop::collection::vec(arb_event(), 0..40), any::<bool>())
                .prop_map(move |(events, need_accept)| Message::log(&s, events, need_accept))
                .boxed(),
        }
    })
}

fn feed_all(chunks: &[&[u8]]) -> Vec<Message> {
    let decoder = StreamDecoder::new();
    for chunk in chunks {
        decoder.feed(chunk).unwrap();
    }
    std::iter::from_fn(|| decoder.dequeue()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_roundtrip(msg in arb_message()) {
        let decoded = frame::decode_frame(&frame::encode(&msg).unwrap()).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn prop_split_point_independent(msg in arb_message(), split in any::<prop::sample::Index>()) {
        let bytes = frame::encode(&msg).unwrap();
        let k = split.index(bytes.len() + 1);

        let whole = feed_all(&[&bytes]);
        let split = feed_all(&[&bytes[..k], &bytes[k..]]);
        prop_assert_eq!(&whole, &split);
        prop_assert_eq!(whole, vec![msg]);
    }

    #[test]
    fn prop_multi_frame_any_fragmentation(
        a in arb_message(),
        b in arb_message(),
        sizes in prop::collection::vec(1usize..64, 1..32),
    ) {
        let mut bytes = frame::encode(&a).unwrap().to_vec();
        bytes.extend_from_slice(&frame::encode(&b).unwrap());

        let mut chunks = Vec::new();
        let mut rest = &bytes[..];
        for size in sizes.iter().cycle() {
            if rest.is_empty() {
                break;
            }
            let (head, tail) = rest.split_at((*size).min(rest.len()));
            chunks.push(head);
            rest = tail;
        }
        prop_assert_eq!(feed_all(&chunks), vec![a, b]);
    }

    #[test]
    fn prop_single_byte_corruption_detected(
        msg in arb_message(),
        pos in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut bytes = frame::encode(&msg).unwrap().to_vec();
        // Digest or body; size fields are covered by the length checks.
        let idx = 8 + pos.index(bytes.len() - 8);
        bytes[idx] ^= flip;

        let decoder = StreamDecoder::new();
        let err = decoder.feed(&bytes).unwrap_err();
        prop_assert!(err.is_connection_fatal());
        prop_assert!(decoder.is_poisoned());
        prop_assert!(decoder.dequeue().is_none());
    }
}

#[test]
fn test_corruption_error_kinds() {
    let sender = Identity::new("h", OsKind::Linux, "v", "abcd1234");
    let msg = Message::log(
        &sender,
        (0..50)
            .map(|i| Event {
                xml: "<Event/>".repeat(8),
                format: "same text".into(),
                timestamp: "t".into(),
                provider: "p".into(),
                level: LogLevel::Info,
                record_id: i,
            })
            .collect(),
        true,
    );
    let bytes = frame::encode(&msg).unwrap().to_vec();

    let mut digest_flip = bytes.clone();
    digest_flip[HEADER_SIZE - 1] ^= 0x01;
    assert!(matches!(
        frame::decode_frame(&digest_flip),
        Err(FrameError::Corrupted { .. })
    ));

    let mut body_flip = bytes;
    let last = body_flip.len() - 1;
    body_flip[last] ^= 0x01;
    assert!(frame::decode_frame(&body_flip).unwrap_err().is_corruption());
}
