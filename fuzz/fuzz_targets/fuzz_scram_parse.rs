#![no_main]

use libfuzzer_sys::arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use rds_iam_conn::auth::{ChannelBinding, ScramClient};

#[derive(Debug)]
struct ScramInput {
    username: String,
    password: String,
    binding: Option<Vec<u8>>,
    server_first: String,
    server_final: String,
}

impl<'a> Arbitrary<'a> for ScramInput {
    fn arbitrary(u: &mut Unstructured<'a>) -> libfuzzer_sys::arbitrary::Result<Self> {
        Ok(Self {
            username: u.arbitrary()?,
            password: u.arbitrary()?,
            binding: u.arbitrary()?,
            server_first: u.arbitrary()?,
            server_final: u.arbitrary()?,
        })
    }
}

fuzz_target!(|input: ScramInput| {
    let binding = match input.binding {
        Some(hash) => ChannelBinding::TlsServerEndPoint(hash),
        None => ChannelBinding::None,
    };
    let mut client = ScramClient::with_channel_binding(input.username, input.password, binding);
    let _first = client.client_first();

    if let Ok((_, state)) = client.client_final(&input.server_first) {
        let _ = client.verify_server_final(&input.server_final, &state);
    }
});
