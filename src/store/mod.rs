//! # Certificate Store
//!
//! Bookkeeping of issued certificates behind the [`CertStorer`] trait, with an in-memory and a
//! SQLite backend.
//!
//! Both backends share these rules:
//!
//! * [`CertStorer::get`] on an unknown key id fails with [`StoreError::NotFound`].
//! * [`CertStorer::revoke`] on an unknown or already revoked key id succeeds and changes nothing.
//! * Overwriting a record never clears its revoked flag.
//! * [`CertStorer::list`] returns records ordered by key id.
use log::info;
use serde::{Deserialize, Serialize};
use ssh_key::Certificate;
use thiserror::Error;

use crate::signer::unix_seconds;

pub mod config;
pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors returned by every [`CertStorer`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists for the key id.
    #[error("no certificate with key id {0}")]
    NotFound(String),
    /// The SQLite backend failed.
    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),
    /// The principals column could not be encoded or decoded.
    #[error("failed to encode principals: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A certificate could not be re-encoded for its record.
    #[error("failed to encode certificate: {0}")]
    Parse(#[from] ssh_key::Error),
    /// A timestamp is larger than [`MAX_TIMESTAMP`].
    #[error("timestamp {0} is out of range")]
    OutOfRange(u64),
    /// A thread panicked while holding the store lock.
    #[error("store lock poisoned")]
    Poisoned,
    /// The directory holding the database could not be created.
    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),
}

/// Largest timestamp a record may carry. SQLite integers are signed, and the in-memory backend
/// applies the same limit.
pub const MAX_TIMESTAMP: u64 = i64::MAX as u64;

/// The persisted fact of an issued certificate.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CertRecord {
    pub key_id: String,
    pub principals: Vec<String>,
    /// Unix seconds, the certificate's valid-after.
    pub created_at: u64,
    /// Unix seconds, the certificate's valid-before.
    pub expires: u64,
    /// The certificate in OpenSSH format.
    pub raw: Vec<u8>,
    pub revoked: bool,
}

impl CertRecord {
    /// A record is expired once its valid-before is not in the future.
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires <= now
    }
}

/// Persistence for issued certificates.
pub trait CertStorer: Send + Sync {
    /// Inserts `record`, replacing any record with the same key id.
    fn set_record(&self, record: &CertRecord) -> Result<(), StoreError>;

    /// Records a signed certificate.
    fn set_cert(&self, cert: &Certificate) -> Result<(), StoreError> {
        self.set_record(&parse_certificate(cert)?)
    }

    /// Looks up the record for `key_id`.
    fn get(&self, key_id: &str) -> Result<CertRecord, StoreError>;

    /// Returns every record, ordered by key id.
    fn list(&self) -> Result<Vec<CertRecord>, StoreError>;

    /// Marks the record for `key_id` as revoked.
    fn revoke(&self, key_id: &str) -> Result<(), StoreError>;

    /// Returns the revoked records that have not expired yet.
    fn get_revoked(&self) -> Result<Vec<CertRecord>, StoreError>;

    /// Releases the backend's resources.
    fn close(self: Box<Self>) -> Result<(), StoreError>;
}

/// Maps a signed certificate onto the record stored for it.
pub fn parse_certificate(cert: &Certificate) -> Result<CertRecord, StoreError> {
    Ok(CertRecord {
        key_id: cert.key_id().to_string(),
        principals: cert.valid_principals().to_vec(),
        created_at: cert.valid_after(),
        expires: cert.valid_before(),
        raw: cert.to_openssh()?.into_bytes(),
        revoked: false,
    })
}

/// Opens the backend selected by `config`.
pub fn open(config: &config::DatabaseConfig) -> Result<Box<dyn CertStorer>, StoreError> {
    match config {
        config::DatabaseConfig::Mem => {
            info!("using in-memory certificate store");
            Ok(Box::new(MemoryStore::new()))
        }
        config::DatabaseConfig::Sqlite { path } => {
            info!("using sqlite certificate store at {:?}", path);
            Ok(Box::new(SqliteStore::open(path)?))
        }
    }
}

/// Returns `created_at` and `expires` of `record` as database integers, or
/// [`StoreError::OutOfRange`] if either exceeds [`MAX_TIMESTAMP`].
fn check_timestamps(record: &CertRecord) -> Result<(i64, i64), StoreError> {
    let to_sql = |seconds: u64| i64::try_from(seconds).map_err(|_| StoreError::OutOfRange(seconds));
    Ok((to_sql(record.created_at)?, to_sql(record.expires)?))
}

fn now() -> u64 {
    unix_seconds(std::time::SystemTime::now())
}

#[cfg(test)]
mod test {
    use super::*;
    use ssh_key::certificate::{Builder as CertBuilder, CertType};
    use ssh_key::rand_core::OsRng;
    use ssh_key::{Algorithm, PrivateKey};

    #[test]
    fn parse_certificate_mirrors_fields() {
        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let now = now();

        let mut builder =
            CertBuilder::new_with_random_nonce(&mut OsRng, subject.public_key(), now - 10, now)
                .unwrap();
        builder.key_id("id").unwrap();
        builder.cert_type(CertType::User).unwrap();
        builder.valid_principal("principal").unwrap();
        builder.valid_principal("second").unwrap();
        let cert = builder.sign(&ca).unwrap();

        let record = parse_certificate(&cert).unwrap();
        assert_eq!(record.key_id, cert.key_id());
        assert_eq!(record.principals, cert.valid_principals());
        assert_eq!(record.expires, cert.valid_before());
        assert_eq!(record.created_at, cert.valid_after());
        assert!(!record.revoked);

        let raw = String::from_utf8(record.raw).unwrap();
        assert_eq!(Certificate::from_openssh(&raw).unwrap(), cert);
    }

    #[test]
    fn open_selects_backend() {
        let store = open(&config::DatabaseConfig::Mem).unwrap();
        assert!(store.list().unwrap().is_empty());
        store.close().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = open(&config::DatabaseConfig::Sqlite {
            path: dir.path().join("certs.db"),
        })
        .unwrap();
        assert!(store.list().unwrap().is_empty());
        store.close().unwrap();
        assert!(dir.path().join("certs.db").exists());
    }

    #[test]
    fn timestamp_limit() {
        let mut record = CertRecord {
            created_at: 1,
            expires: MAX_TIMESTAMP,
            ..Default::default()
        };
        assert_eq!(check_timestamps(&record).unwrap(), (1, i64::MAX));

        record.expires = MAX_TIMESTAMP + 1;
        assert!(matches!(
            check_timestamps(&record),
            Err(StoreError::OutOfRange(e)) if e == MAX_TIMESTAMP + 1
        ));
    }

    #[test]
    fn expiry_boundary() {
        let record = CertRecord {
            expires: 100,
            ..Default::default()
        };
        assert!(!record.is_expired_at(99));
        assert!(record.is_expired_at(100));
    }
}
