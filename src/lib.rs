//! Signing and bookkeeping core of an SSH certificate authority.
//!
//! [`signer::KeySigner`] issues short-lived user certificates and encodes revocation lists,
//! [`store::CertStorer`] keeps track of what was issued and revoked. The operator CLI in this
//! crate is a thin layer over both.
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

pub mod config;
pub mod signer;
pub mod store;

use crate::config::Config;
use crate::signer::{KeySigner, SignRequest};
use crate::store::{CertStorer, StoreError};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// config file path
    #[arg(short = 'c', long)]
    pub config_file: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sign a public key and record the certificate
    Sign {
        /// principal the certificate is issued for
        #[arg(short, long)]
        principal: String,
        /// public key file in authorized_keys format
        #[arg(short, long)]
        key: PathBuf,
        /// requested validity, capped by ssh.max_age
        #[arg(long, value_parser = humantime::parse_duration, default_value = "24h")]
        valid_for: Duration,
    },
    /// List all recorded certificates
    List,
    /// Print a recorded certificate
    Show { key_id: String },
    /// Revoke certificates by key id
    Revoke {
        #[arg(required = true)]
        key_ids: Vec<String>,
    },
    /// Write the key revocation list
    Krl {
        /// output file
        #[arg(short, long)]
        out: PathBuf,
    },
}

/// Sets up `env_logger`, logging at `info` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    if env::var("RUST_LOG").is_err() {
        // only called from main before any other thread exists
        unsafe {
            env::set_var("RUST_LOG", "info");
        }
    }
    let _ = env_logger::try_init();
}

/// Runs a CLI command, printing its output to stdout.
pub fn run(args: CliArgs) -> Result<()> {
    run_with_output(args, &mut io::stdout().lock())
}

/// Runs a CLI command, printing its output to `out`.
///
/// The store is closed before returning, whether or not the command succeeded.
pub fn run_with_output<W: Write>(args: CliArgs, out: &mut W) -> Result<()> {
    let config = config::read_config(&args.config_file)?;
    let store = store::open(&config.database)?;
    let result = execute(args.command, &config, store.as_ref(), out);
    let closed = store.close();
    result?;
    closed?;
    Ok(())
}

fn execute<W: Write>(
    command: Command,
    config: &Config,
    store: &dyn CertStorer,
    out: &mut W,
) -> Result<()> {
    match command {
        Command::Sign {
            principal,
            key,
            valid_for,
        } => {
            if config.database == store::config::DatabaseConfig::Mem {
                warn!("the in-memory store forgets this certificate when the command exits");
            }
            let signer = KeySigner::from_config(&config.ssh)?;
            let key = fs::read_to_string(&key)
                .with_context(|| format!("failed to read public key {:?}", key))?;
            let request = SignRequest {
                key,
                principal,
                valid_until: SystemTime::now() + valid_for,
            };
            let cert = signer.sign_user_key(&request)?;
            store.set_cert(&cert)?;
            info!("issued certificate {}", cert.key_id());
            writeln!(out, "{}", cert.to_openssh()?)?;
        }
        Command::List => {
            for record in store.list()? {
                writeln!(
                    out,
                    "{}\t{}\t{}\t{}\t{}",
                    record.key_id,
                    record.principals.join(","),
                    record.created_at,
                    record.expires,
                    if record.revoked { "revoked" } else { "valid" }
                )?;
            }
        }
        Command::Show { key_id } => {
            let record = store.get(&key_id)?;
            out.write_all(&record.raw)?;
            writeln!(out)?;
        }
        Command::Revoke { key_ids } => {
            for key_id in key_ids {
                if let Err(StoreError::NotFound(_)) = store.get(&key_id) {
                    warn!("no certificate with key id {}", key_id);
                }
                store.revoke(&key_id)?;
            }
        }
        Command::Krl { out: path } => {
            let signer = KeySigner::from_config(&config.ssh)?;
            let revoked = store.get_revoked()?;
            let krl = signer.generate_revocation_list(&revoked)?;
            fs::write(&path, &krl)
                .with_context(|| format!("failed to write revocation list {:?}", path))?;
            writeln!(
                out,
                "wrote {} revoked certificates to {}",
                revoked.len(),
                path.display()
            )?;
        }
    }
    Ok(())
}
