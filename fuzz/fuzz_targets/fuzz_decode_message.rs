#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use rds_iam_conn::protocol::{decode_message, BackendMessage};

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    // Several messages may arrive in one TCP segment
    while !buf.is_empty() {
        match decode_message(&mut buf) {
            Ok((msg, consumed)) => {
                assert!(consumed >= 5 && consumed <= buf.len());
                let _ = msg.name();
                if let BackendMessage::ErrorResponse(fields) = &msg {
                    let _ = fields.to_string();
                }
                let _ = buf.split_to(consumed);
            }
            Err(_) => break,
        }
    }
});
