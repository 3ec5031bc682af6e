#![no_main]

use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use libfuzzer_sys::fuzz_target;
use ssh_ca_core::signer::{KeySigner, SignRequest};
use ssh_key::private::PrivateKey;
use ssh_key::rand_core::OsRng;
use ssh_key::Algorithm;

static SIGNER: LazyLock<KeySigner> = LazyLock::new(|| {
    let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    KeySigner::new(
        ca,
        Duration::from_secs(3600),
        vec!["ec2-user".to_string()],
        vec!["permit-pty".to_string()],
    )
});

fuzz_target!(|input: (String, String, u32)| {
    let (key, principal, valid_for) = input;
    let request = SignRequest {
        key,
        principal,
        valid_until: SystemTime::now() + Duration::from_secs(valid_for.into()),
    };
    if let Ok(cert) = SIGNER.sign_user_key(&request) {
        assert_eq!(cert.valid_principals()[0], request.principal);
    }
});
