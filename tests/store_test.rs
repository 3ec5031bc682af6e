use std::time::{SystemTime, UNIX_EPOCH};

use ssh_key::certificate::{Builder as CertBuilder, CertType, Certificate};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, private::PrivateKey};
use tempfile::tempdir;

use ssh_ca_core::store::{
    CertRecord, CertStorer, MAX_TIMESTAMP, MemoryStore, SqliteStore, StoreError,
};

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// A user certificate with key id "key", valid for another hour.
fn test_cert() -> Certificate {
    let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let mut builder =
        CertBuilder::new_with_random_nonce(&mut OsRng, subject.public_key(), now(), now() + 3600)
            .unwrap();
    builder.key_id("key").unwrap();
    builder.cert_type(CertType::User).unwrap();
    builder.valid_principal("gopher").unwrap();
    builder.sign(&ca).unwrap()
}

/// Runs the same sequence of operations against any backend and reports what it observed.
fn exercise_store(db: Box<dyn CertStorer>) -> Vec<CertRecord> {
    let ids = ["a", "b"];
    let expires = [now() - 10, now() + 3600];
    for (id, expires) in ids.iter().zip(expires) {
        let record = CertRecord {
            key_id: id.to_string(),
            expires,
            ..Default::default()
        };
        db.set_record(&record).unwrap();
    }
    let records = db.list().unwrap();
    assert_eq!(records.len(), ids.len());

    let cert = test_cert();
    db.set_cert(&cert).unwrap();
    let stored = db.get("key").unwrap();
    assert_eq!(stored.principals, vec!["gopher"]);
    assert_eq!(stored.expires, cert.valid_before());
    assert!(!stored.revoked);

    db.revoke("key").unwrap();
    // an expired certificate is not reported even when revoked
    db.revoke("a").unwrap();
    // revoking twice or revoking something unknown is not an error
    db.revoke("key").unwrap();
    db.revoke("missing").unwrap();

    let revoked = db.get_revoked().unwrap();
    assert_eq!(revoked.len(), 1);
    assert_eq!(revoked[0].key_id, "key");
    assert!(revoked[0].revoked);

    assert!(db.get("a").unwrap().revoked);
    assert!(!db.get("b").unwrap().revoked);
    assert!(matches!(db.get("missing"), Err(StoreError::NotFound(_))));

    let all = db.list().unwrap();
    db.close().unwrap();
    all
}

#[test]
fn memory_store() {
    exercise_store(Box::new(MemoryStore::new()));
}

#[test]
fn sqlite_store() {
    let dir = tempdir().unwrap();
    exercise_store(Box::new(SqliteStore::open(dir.path().join("certs.db")).unwrap()));
}

#[test]
fn backends_agree() {
    let dir = tempdir().unwrap();
    let memory = exercise_store(Box::new(MemoryStore::new()));
    let sqlite = exercise_store(Box::new(
        SqliteStore::open(dir.path().join("certs.db")).unwrap(),
    ));

    let summary = |records: &[CertRecord]| -> Vec<(String, Vec<String>, bool)> {
        records
            .iter()
            .map(|r| (r.key_id.clone(), r.principals.clone(), r.revoked))
            .collect()
    };
    assert_eq!(summary(&memory), summary(&sqlite));
    assert_eq!(
        memory.iter().map(|r| r.key_id.as_str()).collect::<Vec<_>>(),
        vec!["a", "b", "key"]
    );
}

#[test]
fn set_record_is_last_write_wins() {
    let stores: Vec<Box<dyn CertStorer>> = vec![
        Box::new(MemoryStore::new()),
        Box::new(SqliteStore::open_in_memory().unwrap()),
    ];
    for db in stores {
        let mut record = CertRecord {
            key_id: "same".to_string(),
            principals: vec!["first".to_string()],
            created_at: now(),
            expires: now() + 60,
            ..Default::default()
        };
        db.set_record(&record).unwrap();
        record.principals = vec!["second".to_string()];
        record.raw = b"raw".to_vec();
        db.set_record(&record).unwrap();

        let records = db.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], record);
        db.close().unwrap();
    }
}

#[test]
fn timestamp_limit_is_shared() {
    let stores: Vec<Box<dyn CertStorer>> = vec![
        Box::new(MemoryStore::new()),
        Box::new(SqliteStore::open_in_memory().unwrap()),
    ];
    for db in stores {
        let far = CertRecord {
            key_id: "far".to_string(),
            expires: MAX_TIMESTAMP + 1,
            ..Default::default()
        };
        assert!(matches!(
            db.set_record(&far),
            Err(StoreError::OutOfRange(e)) if e == MAX_TIMESTAMP + 1
        ));
        assert!(matches!(db.get("far"), Err(StoreError::NotFound(_))));

        let limit = CertRecord {
            key_id: "limit".to_string(),
            expires: MAX_TIMESTAMP,
            revoked: true,
            ..Default::default()
        };
        db.set_record(&limit).unwrap();
        assert_eq!(db.get("limit").unwrap(), limit);
        assert_eq!(db.get_revoked().unwrap(), vec![limit]);
        db.close().unwrap();
    }
}
