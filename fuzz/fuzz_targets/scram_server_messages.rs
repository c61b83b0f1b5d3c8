#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pgwire_auth::ScramSha256;

#[derive(Debug, Arbitrary)]
struct FuzzExchange {
    server_first: Vec<u8>,
    server_final: Vec<u8>,
    salted: [u8; 32],
}

fuzz_target!(|input: FuzzExchange| {
    let mut scram = ScramSha256::with_nonce("app", "rOprNGfwEbeRWgbNEkqO");
    // Skip key derivation; any 32 bytes stand in for the salted password.
    if let Ok(first) = scram.parse_server_first(&input.server_first) {
        if scram.client_final(&first, &input.salted).is_ok() {
            let _ = scram.verify_server_final(&input.server_final);
        }
    }
});
