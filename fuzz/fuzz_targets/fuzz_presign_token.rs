#![no_main]

use chrono::{TimeZone, Utc};
use libfuzzer_sys::fuzz_target;
use rds_iam_conn::auth::{presign_token, AwsCredentials};

fuzz_target!(|input: (String, String, String, u16, u32)| {
    let (username, host, region, port, secs) = input;
    let Some(now) = Utc.timestamp_opt(i64::from(secs), 0).single() else {
        return;
    };
    let credentials = AwsCredentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY");

    if let Ok(token) = presign_token(&credentials, &username, &host, &region, port, now) {
        assert!(token.starts_with(&format!("{}:{}/?", host, port)));
        assert!(token.contains("X-Amz-Signature="));
        // Every query value is percent-encoded
        let query = &token[host.len()..];
        assert!(!query.contains(' '));
    }
});
