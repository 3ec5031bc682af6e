#![no_main]

use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use libfuzzer_sys::fuzz_target;
use ssh_ca_core::signer::krl::Krl;
use ssh_key::certificate::{Builder as CertBuilder, CertType, Certificate};
use ssh_key::private::PrivateKey;
use ssh_key::rand_core::OsRng;
use ssh_key::Algorithm;

static CA: LazyLock<PrivateKey> =
    LazyLock::new(|| PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap());

static CERT: LazyLock<Certificate> = LazyLock::new(|| {
    let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    let mut builder =
        CertBuilder::new_with_random_nonce(&mut OsRng, subject.public_key(), now, now + 3600)
            .unwrap();
    builder.serial(1).unwrap();
    builder.key_id("fuzz").unwrap();
    builder.cert_type(CertType::User).unwrap();
    builder.valid_principal("fuzz").unwrap();
    builder.sign(&*CA).unwrap()
});

fuzz_target!(|data: &[u8]| {
    if let Ok(krl) = Krl::parse(data) {
        let _ = krl.is_revoked(&CERT);
        let _ = krl.verify(CA.public_key());
    }
});
