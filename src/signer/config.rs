//! # Signer Configuration
//!
//! This module defines the `[ssh]` section of the configuration file: where the CA key lives
//! and the policy applied to every certificate the signer issues.
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Deserializer};

use crate::config::InsertConfigRoot;

/// Extensions granted to a certificate when the configuration does not list any.
pub const DEFAULT_PERMISSIONS: [&str; 5] = [
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

/// Configuration for the certificate signer.
#[derive(Deserialize, Debug, Clone)]
pub struct SshConfig {
    /// The path to the CA's private key in OpenSSH format.
    pub signing_key: PathBuf,
    /// Principals appended to every certificate after the requested one.
    #[serde(default)]
    pub additional_principals: Vec<String>,
    /// Upper bound on the validity of any issued certificate.
    #[serde(deserialize_with = "deserialize_duration")]
    pub max_age: Duration,
    /// Extensions added to every certificate.
    #[serde(default = "default_permissions")]
    pub permissions: Vec<String>,
}

fn default_permissions() -> Vec<String> {
    DEFAULT_PERMISSIONS.iter().map(|p| p.to_string()).collect()
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

impl InsertConfigRoot for SshConfig {
    /// Resolves a relative `signing_key` against the directory of the configuration file.
    fn insert_config_path(&mut self, config_root: &PathBuf) -> Result<()> {
        if !self.signing_key.has_root() {
            let mut key_path = config_root.clone();
            key_path.push(&self.signing_key);
            self.signing_key = key_path;
        }
        Ok(())
    }

    /// Checks that the CA key exists and that the policy is usable.
    fn check_paths(&self) -> Result<()> {
        if self.max_age.is_zero() {
            bail!("ssh.max_age must be greater than zero");
        }
        if self.signing_key.exists() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("CA key file {:?} not found", self.signing_key),
            )
            .into())
        }
    }
}
