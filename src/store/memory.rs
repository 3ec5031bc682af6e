//! # In-Memory Store
//!
//! A [`CertStorer`] keeping records in a map guarded by a read-write lock.
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info};

use super::{CertRecord, CertStorer, StoreError, check_timestamps, now};

/// A certificate store in process memory.
///
/// Intended for tests and throwaway deployments; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    certs: RwLock<BTreeMap<String, CertRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, CertRecord>>, StoreError> {
        self.certs.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, CertRecord>>, StoreError> {
        self.certs.write().map_err(|_| StoreError::Poisoned)
    }
}

impl CertStorer for MemoryStore {
    fn set_record(&self, record: &CertRecord) -> Result<(), StoreError> {
        check_timestamps(record)?;
        let mut certs = self.write()?;
        let mut record = record.clone();
        if let Some(existing) = certs.get(&record.key_id) {
            record.revoked |= existing.revoked;
        }
        debug!("storing certificate {}", record.key_id);
        certs.insert(record.key_id.clone(), record);
        Ok(())
    }

    fn get(&self, key_id: &str) -> Result<CertRecord, StoreError> {
        self.read()?.get(key_id).cloned().ok_or_else(|| {
            debug!("certificate {} not found", key_id);
            StoreError::NotFound(key_id.to_string())
        })
    }

    fn list(&self) -> Result<Vec<CertRecord>, StoreError> {
        Ok(self.read()?.values().cloned().collect())
    }

    fn revoke(&self, key_id: &str) -> Result<(), StoreError> {
        match self.write()?.get_mut(key_id) {
            Some(record) => {
                if !record.revoked {
                    info!("revoking certificate {}", key_id);
                    record.revoked = true;
                }
            }
            None => debug!("not revoking unknown certificate {}", key_id),
        }
        Ok(())
    }

    fn get_revoked(&self) -> Result<Vec<CertRecord>, StoreError> {
        let now = now();
        Ok(self
            .read()?
            .values()
            .filter(|record| record.revoked && !record.is_expired_at(now))
            .cloned()
            .collect())
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
