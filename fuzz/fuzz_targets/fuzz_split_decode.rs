#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use rds_iam_conn::protocol::{decode_message, is_incomplete};

#[derive(Debug)]
struct SplitInput {
    data: Vec<u8>,
    split_points: Vec<u8>,
}

impl<'a> Arbitrary<'a> for SplitInput {
    fn arbitrary(u: &mut Unstructured<'a>) -> libfuzzer_sys::arbitrary::Result<Self> {
        Ok(Self {
            data: u.arbitrary()?,
            split_points: u.arbitrary()?,
        })
    }
}

/// Decode everything available; `None` once the stream is malformed
fn drain(buf: &mut BytesMut, out: &mut Vec<String>) -> Option<()> {
    loop {
        match decode_message(buf) {
            Ok((msg, consumed)) => {
                out.push(msg.name().to_string());
                let _ = buf.split_to(consumed);
            }
            Err(e) if is_incomplete(&e) => return Some(()),
            Err(_) => return None,
        }
    }
}

// Arrival boundaries must not change what is decoded
fuzz_target!(|input: SplitInput| {
    let mut whole = BytesMut::from(&input.data[..]);
    let mut expected = Vec::new();
    let whole_ok = drain(&mut whole, &mut expected).is_some();

    let mut splits: Vec<usize> = input
        .split_points
        .iter()
        .map(|&b| (b as usize) % (input.data.len() + 1))
        .collect();
    splits.push(0);
    splits.push(input.data.len());
    splits.sort_unstable();
    splits.dedup();

    let mut buf = BytesMut::new();
    let mut actual = Vec::new();
    let mut split_ok = true;
    for window in splits.windows(2) {
        buf.extend_from_slice(&input.data[window[0]..window[1]]);
        if drain(&mut buf, &mut actual).is_none() {
            split_ok = false;
            break;
        }
    }

    assert_eq!(whole_ok, split_ok);
    if whole_ok {
        assert_eq!(expected, actual);
    }
});
