//! # Signer
//!
//! This module holds the CA key and turns signing requests into SSH user certificates. It also
//! encodes revoked certificates as a signed key revocation list (KRL).
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use ssh_key::rand_core::{OsRng, RngCore};
use ssh_key::{
    HashAlg, PublicKey,
    certificate::{Builder as CertBuilder, CertType, Certificate},
    private::PrivateKey,
};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::store::CertRecord;

/// Configuration types for the signer.
pub mod config;
/// OpenSSH key revocation list encoding.
pub mod krl;

/// How far `valid-after` is backdated, so that hosts with a slightly slow clock accept a
/// certificate the moment it is issued.
pub const CLOCK_SKEW_ALLOWANCE: Duration = Duration::from_secs(5 * 60);

/// Errors that can occur while signing.
#[derive(Debug, Error)]
pub enum SignerError {
    /// The supplied key text is not a valid OpenSSH key.
    #[error("failed to parse key: {0}")]
    Parse(#[source] ssh_key::Error),
    #[error("a principal is required")]
    EmptyPrincipal,
    /// The requested deadline leaves no time for the certificate to be valid.
    #[error("requested validity ends at {valid_before}, which is not after {now}")]
    InvalidValidity { valid_before: u64, now: u64 },
    #[error("the CA key is encrypted")]
    EncryptedKey,
    #[error("signing failed: {0}")]
    Signing(#[source] ssh_key::Error),
    #[error("failed to build revocation list: {0}")]
    Encoding(#[from] krl::KrlError),
    #[error("failed to read CA key: {0}")]
    Io(#[from] std::io::Error),
}

/// A request for a user certificate.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SignRequest {
    /// The public key to certify, in authorized_keys format.
    pub key: String,
    /// The identity the certificate is issued for. Always the first valid principal.
    pub principal: String,
    /// Latest moment the certificate may be valid until.
    pub valid_until: SystemTime,
}

/// Issues user certificates with a CA key held in memory.
///
/// The signer is immutable after construction and can be shared between threads.
pub struct KeySigner {
    ca: PrivateKey,
    validity: Duration,
    principals: Vec<String>,
    permissions: BTreeSet<String>,
}

impl KeySigner {
    /// Creates a new `KeySigner`.
    ///
    /// # Arguments
    ///
    /// * `ca` - The CA private key.
    /// * `validity` - The longest validity any certificate may get.
    /// * `principals` - Principals appended to every certificate after the requested one.
    /// * `permissions` - Extensions added to every certificate.
    pub fn new(
        ca: PrivateKey,
        validity: Duration,
        principals: Vec<String>,
        permissions: Vec<String>,
    ) -> Self {
        KeySigner {
            ca,
            validity,
            principals,
            permissions: permissions.into_iter().collect(),
        }
    }

    /// Loads the CA key and policy from the `[ssh]` configuration section.
    pub fn from_config(config: &config::SshConfig) -> Result<Self, SignerError> {
        let mut key_file = File::open(&config.signing_key)?;
        let mut key_buffer = Zeroizing::new(Vec::new());
        key_file.read_to_end(&mut key_buffer)?;

        let ca = PrivateKey::from_openssh(&*key_buffer).map_err(SignerError::Parse)?;
        if ca.is_encrypted() {
            error!("CA key {:?} is encrypted", config.signing_key);
            return Err(SignerError::EncryptedKey);
        }
        info!(
            "loaded {} CA key {}",
            ca.algorithm(),
            ca.fingerprint(HashAlg::Sha256)
        );
        Ok(Self::new(
            ca,
            config.max_age,
            config.additional_principals.clone(),
            config.permissions.clone(),
        ))
    }

    /// The public half of the CA key, as relying hosts should trust it.
    pub fn ca_public_key(&self) -> &PublicKey {
        self.ca.public_key()
    }

    /// Signs the key in `request` and returns a user certificate.
    ///
    /// The certificate expires at the earlier of the requested deadline and now plus the
    /// configured validity. Its valid principals are the requested principal followed by the
    /// configured additional principals.
    pub fn sign_user_key(&self, request: &SignRequest) -> Result<Certificate, SignerError> {
        let public_key = key_from_openssh(&request.key)?;
        if request.principal.is_empty() {
            return Err(SignerError::EmptyPrincipal);
        }

        let now = unix_seconds(SystemTime::now());
        let valid_after = now.saturating_sub(CLOCK_SKEW_ALLOWANCE.as_secs());
        let valid_before =
            unix_seconds(request.valid_until).min(now.saturating_add(self.validity.as_secs()));
        if valid_before <= now {
            return Err(SignerError::InvalidValidity { valid_before, now });
        }

        let key_id = generate_key_id(&request.principal, now);
        info!(
            "signing {} key for {} as {}",
            public_key.algorithm(),
            request.principal,
            key_id
        );

        let mut cert_builder =
            CertBuilder::new_with_random_nonce(&mut OsRng, &public_key, valid_after, valid_before)
                .map_err(SignerError::Signing)?;
        cert_builder
            .serial(OsRng.next_u64())
            .and_then(|b| b.key_id(&key_id))
            .and_then(|b| b.cert_type(CertType::User))
            .and_then(|b| b.comment(public_key.comment()))
            .map_err(SignerError::Signing)?;
        for principal in std::iter::once(&request.principal).chain(&self.principals) {
            debug!("adding principal: {}", principal);
            cert_builder
                .valid_principal(principal)
                .map_err(SignerError::Signing)?;
        }
        for permission in &self.permissions {
            cert_builder
                .extension(permission, "")
                .map_err(SignerError::Signing)?;
        }

        match cert_builder.sign(&self.ca) {
            Ok(cert) => Ok(cert),
            Err(e) => {
                error!("signing {} failed: {}", key_id, e);
                Err(SignerError::Signing(e))
            }
        }
    }

    /// Encodes `records` as a KRL revoking each record's key id, signed with the CA key.
    ///
    /// Records are taken as given; expired ones are not filtered out here.
    pub fn generate_revocation_list(&self, records: &[CertRecord]) -> Result<Vec<u8>, SignerError> {
        let mut builder = krl::KrlBuilder::new();
        builder.comment(format!(
            "revoked certificates of {}",
            self.ca.fingerprint(HashAlg::Sha256)
        ));
        for record in records {
            builder.revoke_key_id(record.key_id.as_str());
        }
        let encoded = builder
            .sign(&self.ca, unix_seconds(SystemTime::now()))
            .map_err(|e| {
                error!("failed to encode revocation list: {}", e);
                SignerError::Encoding(e)
            })?;
        info!(
            "generated revocation list with {} revoked certificates",
            records.len()
        );
        Ok(encoded)
    }
}

/// Parses an OpenSSH public key string (authorized_keys format) into a `PublicKey`.
pub fn key_from_openssh(openssh_key: &str) -> Result<PublicKey, SignerError> {
    PublicKey::from_openssh(openssh_key.trim()).map_err(SignerError::Parse)
}

fn generate_key_id(principal: &str, now: u64) -> String {
    format!("{}_{}_{:08x}", principal, now, rand::random::<u32>())
}

pub(crate) fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;
    use std::io::Write;

    use ssh_key::Algorithm;
    use tempfile::NamedTempFile;

    use crate::signer::krl::Krl;

    fn test_signer() -> KeySigner {
        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        KeySigner::new(
            ca,
            Duration::from_secs(12 * 3600),
            vec!["ec2-user".to_string()],
            vec!["permit-pty".to_string(), "permit-user-rc".to_string()],
        )
    }

    fn request(principal: &str, valid_for: Duration) -> SignRequest {
        let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        SignRequest {
            key: subject.public_key().to_openssh().unwrap(),
            principal: principal.to_string(),
            valid_until: SystemTime::now() + valid_for,
        }
    }

    #[test]
    fn sign_user_key() {
        let signer = test_signer();
        let r = request("gopher1", Duration::from_secs(3600));
        let cert = signer.sign_user_key(&r).unwrap();

        assert_eq!(cert.signature_key(), signer.ca_public_key().key_data());
        let fingerprint = signer.ca_public_key().fingerprint(HashAlg::Sha256);
        cert.validate([&fingerprint]).unwrap();

        assert_eq!(cert.valid_principals(), ["gopher1", "ec2-user"]);
        assert_eq!(cert.cert_type(), CertType::User);
        assert!(cert.key_id().starts_with("gopher1_"));

        let requested = PublicKey::from_openssh(&r.key).unwrap();
        assert_eq!(cert.public_key(), requested.key_data());
        assert_eq!(cert.valid_before(), unix_seconds(r.valid_until));

        let extensions: Vec<&str> = cert.extensions().keys().map(|k| k.as_str()).collect();
        assert_eq!(extensions, vec!["permit-pty", "permit-user-rc"]);
    }

    #[test]
    fn validity_is_capped() {
        let signer = test_signer();
        let before = unix_seconds(SystemTime::now());
        let cert = signer
            .sign_user_key(&request("gopher", Duration::from_secs(48 * 3600)))
            .unwrap();
        let after = unix_seconds(SystemTime::now());

        assert!(cert.valid_before() >= before + 12 * 3600);
        assert!(cert.valid_before() <= after + 12 * 3600);
        assert!(cert.valid_after() <= before);
        assert!(cert.valid_after() >= before - CLOCK_SKEW_ALLOWANCE.as_secs());
    }

    #[test]
    fn rejects_bad_requests() {
        let signer = test_signer();

        let mut bad_key = request("gopher", Duration::from_secs(60));
        bad_key.key = "ssh-ed25519 not-base64".to_string();
        assert!(matches!(
            signer.sign_user_key(&bad_key),
            Err(SignerError::Parse(_))
        ));

        let no_principal = request("", Duration::from_secs(60));
        assert!(matches!(
            signer.sign_user_key(&no_principal),
            Err(SignerError::EmptyPrincipal)
        ));

        let mut expired = request("gopher", Duration::from_secs(0));
        expired.valid_until = SystemTime::now() - Duration::from_secs(60);
        assert!(matches!(
            signer.sign_user_key(&expired),
            Err(SignerError::InvalidValidity { .. })
        ));
    }

    #[test]
    fn principal_is_used_verbatim() {
        let signer = test_signer();
        let cert = signer
            .sign_user_key(&request(" ", Duration::from_secs(60)))
            .unwrap();
        assert_eq!(cert.valid_principals()[0], " ");
        assert!(cert.key_id().starts_with(" _"));
    }

    #[test]
    fn concurrent_key_ids_are_unique() {
        let signer = test_signer();
        let ids: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    s.spawn(|| {
                        signer
                            .sign_user_key(&request("gopher", Duration::from_secs(60)))
                            .unwrap()
                            .key_id()
                            .to_string()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn revocation_list() {
        let signer = test_signer();
        let cert1 = signer
            .sign_user_key(&request("revoked", Duration::from_secs(3600)))
            .unwrap();
        let cert2 = signer
            .sign_user_key(&request("ok", Duration::from_secs(3600)))
            .unwrap();

        let records = vec![CertRecord {
            key_id: cert1.key_id().to_string(),
            ..Default::default()
        }];
        let encoded = signer.generate_revocation_list(&records).unwrap();

        let krl = Krl::parse(&encoded).unwrap();
        assert!(krl.is_revoked(&cert1));
        assert!(!krl.is_revoked(&cert2));
        assert!(krl.verify(signer.ca_public_key()).unwrap());
    }

    #[test]
    fn from_config() {
        let ca_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let mut ca_key_file = NamedTempFile::new().unwrap();
        ca_key_file
            .write_all(
                ca_key
                    .to_openssh(ssh_key::LineEnding::LF)
                    .unwrap()
                    .as_bytes(),
            )
            .unwrap();
        ca_key_file.flush().unwrap();

        let ssh_config = config::SshConfig {
            signing_key: ca_key_file.path().to_path_buf(),
            additional_principals: vec!["ubuntu".to_string()],
            max_age: Duration::from_secs(3600),
            permissions: vec!["permit-pty".to_string()],
        };
        let signer = KeySigner::from_config(&ssh_config).unwrap();
        assert_eq!(signer.ca_public_key(), ca_key.public_key());

        let cert = signer
            .sign_user_key(&request("alice", Duration::from_secs(7200)))
            .unwrap();
        assert_eq!(cert.valid_principals(), ["alice", "ubuntu"]);
    }

    #[test]
    fn from_config_rejects_garbage_key() {
        let mut ca_key_file = NamedTempFile::new().unwrap();
        ca_key_file.write_all(b"not a key").unwrap();
        ca_key_file.flush().unwrap();

        let ssh_config = config::SshConfig {
            signing_key: ca_key_file.path().to_path_buf(),
            additional_principals: Vec::new(),
            max_age: Duration::from_secs(3600),
            permissions: Vec::new(),
        };
        assert!(matches!(
            KeySigner::from_config(&ssh_config),
            Err(SignerError::Parse(_))
        ));
    }
}
