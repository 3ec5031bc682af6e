//! # Key Revocation Lists
//!
//! Reading and writing of the OpenSSH key revocation list (KRL) binary format as described in
//! OpenSSH's `PROTOCOL.krl`. The writer only emits what the signer needs (certificate serials
//! and key ids for a single CA, followed by a signature); the reader understands every section
//! type so lists produced by `ssh-keygen -k` can be checked as well.
use std::collections::BTreeSet;

use log::debug;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use signature::{Signer, Verifier};
use ssh_key::{Algorithm, Certificate, PrivateKey, PublicKey, Signature};
use thiserror::Error;

/// `"SSHKRL\n\0"`
const KRL_MAGIC: u64 = 0x5353_484b_524c_0a00;
const KRL_FORMAT_VERSION: u32 = 1;

const KRL_SECTION_CERTIFICATES: u8 = 1;
const KRL_SECTION_EXPLICIT_KEY: u8 = 2;
const KRL_SECTION_FINGERPRINT_SHA1: u8 = 3;
const KRL_SECTION_SIGNATURE: u8 = 4;
const KRL_SECTION_FINGERPRINT_SHA256: u8 = 5;

const KRL_SECTION_CERT_SERIAL_LIST: u8 = 0x20;
const KRL_SECTION_CERT_SERIAL_RANGE: u8 = 0x21;
const KRL_SECTION_CERT_SERIAL_BITMAP: u8 = 0x22;
const KRL_SECTION_CERT_KEY_ID: u8 = 0x23;

/// Errors raised while building or parsing a KRL.
#[derive(Debug, Error)]
pub enum KrlError {
    #[error("truncated KRL: {needed} bytes needed at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("not a KRL (bad magic)")]
    BadMagic,
    #[error("unsupported KRL format version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown KRL section type {0:#04x}")]
    UnknownSection(u8),
    #[error("unknown KRL certificate section type {0:#04x}")]
    UnknownCertSection(u8),
    #[error("invalid serial range {0}-{1}")]
    InvalidRange(u64, u64),
    #[error("serial bitmap overflows at offset {0}")]
    BitmapOverflow(u64),
    #[error("KRL section follows a signature")]
    TrailingData,
    #[error("KRL string is not valid UTF-8")]
    InvalidUtf8,
    #[error("KRL field of {0} bytes is too large")]
    TooLarge(usize),
    #[error("invalid key in KRL: {0}")]
    Key(#[from] ssh_key::Error),
    #[error("KRL signature: {0}")]
    Signature(#[from] signature::Error),
}

#[derive(Default)]
struct KrlWriter {
    buf: Vec<u8>,
}

impl KrlWriter {
    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_string(&mut self, data: &[u8]) -> Result<(), KrlError> {
        let len = u32::try_from(data.len()).map_err(|_| KrlError::TooLarge(data.len()))?;
        self.put_u32(len);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn put_section(&mut self, section_type: u8, body: &[u8]) -> Result<(), KrlError> {
        self.put_u8(section_type);
        self.put_string(body)
    }
}

struct KrlReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> KrlReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        KrlReader { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], KrlError> {
        if self.data.len() - self.pos < needed {
            return Err(KrlError::Truncated {
                offset: self.pos,
                needed,
            });
        }
        let slice = &self.data[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn get_u8(&mut self) -> Result<u8, KrlError> {
        Ok(self.take(1)?[0])
    }

    fn get_u32(&mut self) -> Result<u32, KrlError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(bytes))
    }

    fn get_u64(&mut self) -> Result<u64, KrlError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(bytes))
    }

    fn get_string(&mut self) -> Result<&'a [u8], KrlError> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    fn get_utf8(&mut self) -> Result<String, KrlError> {
        let bytes = self.get_string()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| KrlError::InvalidUtf8)
    }
}

/// Collects revocations for a single CA and serializes them as a signed KRL.
#[derive(Debug, Default, Clone)]
pub struct KrlBuilder {
    comment: String,
    version: Option<u64>,
    serials: BTreeSet<u64>,
    key_ids: BTreeSet<String>,
}

impl KrlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the free-form comment stored in the KRL header.
    pub fn comment(&mut self, comment: impl Into<String>) -> &mut Self {
        self.comment = comment.into();
        self
    }

    /// Sets the KRL version number. Defaults to the generation date.
    pub fn version(&mut self, version: u64) -> &mut Self {
        self.version = Some(version);
        self
    }

    pub fn revoke_serial(&mut self, serial: u64) -> &mut Self {
        self.serials.insert(serial);
        self
    }

    pub fn revoke_key_id(&mut self, key_id: impl Into<String>) -> &mut Self {
        self.key_ids.insert(key_id.into());
        self
    }

    /// Encodes the list and appends a signature made with `ca_key`.
    ///
    /// All revocations are scoped to certificates issued by `ca_key`. The signature covers
    /// everything from the magic up to and including the signature key.
    pub fn sign(&self, ca_key: &PrivateKey, generated_date: u64) -> Result<Vec<u8>, KrlError> {
        let ca_public = ca_key.public_key().to_bytes()?;

        let mut krl = KrlWriter::default();
        krl.put_u64(KRL_MAGIC);
        krl.put_u32(KRL_FORMAT_VERSION);
        krl.put_u64(self.version.unwrap_or(generated_date));
        krl.put_u64(generated_date);
        krl.put_u64(0);
        krl.put_string(b"")?;
        krl.put_string(self.comment.as_bytes())?;

        if !self.serials.is_empty() || !self.key_ids.is_empty() {
            let mut section = KrlWriter::default();
            section.put_string(&ca_public)?;
            section.put_string(b"")?;
            if !self.serials.is_empty() {
                let mut serials = KrlWriter::default();
                for serial in &self.serials {
                    serials.put_u64(*serial);
                }
                section.put_section(KRL_SECTION_CERT_SERIAL_LIST, &serials.buf)?;
            }
            if !self.key_ids.is_empty() {
                let mut key_ids = KrlWriter::default();
                for key_id in &self.key_ids {
                    key_ids.put_string(key_id.as_bytes())?;
                }
                section.put_section(KRL_SECTION_CERT_KEY_ID, &key_ids.buf)?;
            }
            krl.put_section(KRL_SECTION_CERTIFICATES, &section.buf)?;
        }

        krl.put_u8(KRL_SECTION_SIGNATURE);
        krl.put_string(&ca_public)?;
        let signature: Signature = ca_key.try_sign(&krl.buf)?;
        let mut encoded = KrlWriter::default();
        encoded.put_string(signature.algorithm().as_str().as_bytes())?;
        encoded.put_string(signature.as_bytes())?;
        krl.put_string(&encoded.buf)?;

        debug!(
            "encoded KRL with {} serials and {} key ids ({} bytes)",
            self.serials.len(),
            self.key_ids.len(),
            krl.buf.len()
        );
        Ok(krl.buf)
    }
}

#[derive(Debug, Default, Clone)]
struct CertificateSection {
    /// `None` means the section applies to certificates from any CA.
    ca_key: Option<Vec<u8>>,
    serials: BTreeSet<u64>,
    ranges: Vec<(u64, u64)>,
    key_ids: BTreeSet<String>,
}

impl CertificateSection {
    fn parse(body: &[u8]) -> Result<Self, KrlError> {
        let mut reader = KrlReader::new(body);
        let ca_key = reader.get_string()?;
        let _reserved = reader.get_string()?;
        let mut section = CertificateSection {
            ca_key: (!ca_key.is_empty()).then(|| ca_key.to_vec()),
            ..Default::default()
        };

        while !reader.is_empty() {
            let section_type = reader.get_u8()?;
            let mut sub = KrlReader::new(reader.get_string()?);
            match section_type {
                KRL_SECTION_CERT_SERIAL_LIST => {
                    while !sub.is_empty() {
                        section.serials.insert(sub.get_u64()?);
                    }
                }
                KRL_SECTION_CERT_SERIAL_RANGE => {
                    let low = sub.get_u64()?;
                    let high = sub.get_u64()?;
                    if low > high {
                        return Err(KrlError::InvalidRange(low, high));
                    }
                    section.ranges.push((low, high));
                }
                KRL_SECTION_CERT_SERIAL_BITMAP => {
                    let offset = sub.get_u64()?;
                    let bitmap = sub.get_string()?;
                    // mpint, most significant byte first
                    for (byte_index, byte) in bitmap.iter().rev().enumerate() {
                        for bit in 0..8 {
                            if byte & (1 << bit) == 0 {
                                continue;
                            }
                            let serial = offset
                                .checked_add((byte_index * 8 + bit) as u64)
                                .ok_or(KrlError::BitmapOverflow(offset))?;
                            section.serials.insert(serial);
                        }
                    }
                }
                KRL_SECTION_CERT_KEY_ID => {
                    while !sub.is_empty() {
                        section.key_ids.insert(sub.get_utf8()?);
                    }
                }
                other => return Err(KrlError::UnknownCertSection(other)),
            }
        }
        Ok(section)
    }

    fn matches(&self, ca_key: Option<&[u8]>, cert: &Certificate) -> bool {
        if let Some(section_ca) = &self.ca_key {
            if ca_key != Some(section_ca.as_slice()) {
                return false;
            }
        }
        let serial = cert.serial();
        self.key_ids.contains(cert.key_id())
            || self.serials.contains(&serial)
            || self
                .ranges
                .iter()
                .any(|(low, high)| (*low..=*high).contains(&serial))
    }
}

#[derive(Debug, Clone)]
struct KrlSignature {
    key: Vec<u8>,
    signature: Vec<u8>,
    /// Length of the KRL prefix covered by this signature.
    signed_len: usize,
}

/// A parsed key revocation list.
#[derive(Debug, Clone, Default)]
pub struct Krl {
    pub version: u64,
    pub generated_date: u64,
    pub flags: u64,
    pub comment: String,
    certificates: Vec<CertificateSection>,
    explicit_keys: BTreeSet<Vec<u8>>,
    sha1_fingerprints: BTreeSet<Vec<u8>>,
    sha256_fingerprints: BTreeSet<Vec<u8>>,
    signatures: Vec<KrlSignature>,
    raw: Vec<u8>,
}

impl Krl {
    /// Parses a binary KRL.
    ///
    /// Signatures are only decoded here; use [`Krl::verify`] to check them.
    pub fn parse(data: &[u8]) -> Result<Self, KrlError> {
        let mut reader = KrlReader::new(data);
        if reader.get_u64()? != KRL_MAGIC {
            return Err(KrlError::BadMagic);
        }
        let format_version = reader.get_u32()?;
        if format_version != KRL_FORMAT_VERSION {
            return Err(KrlError::UnsupportedVersion(format_version));
        }

        let mut krl = Krl {
            version: reader.get_u64()?,
            generated_date: reader.get_u64()?,
            flags: reader.get_u64()?,
            ..Default::default()
        };
        let _reserved = reader.get_string()?;
        krl.comment = reader.get_utf8()?;

        while !reader.is_empty() {
            let section_type = reader.get_u8()?;
            if section_type == KRL_SECTION_SIGNATURE {
                let key = reader.get_string()?.to_vec();
                let signed_len = reader.pos;
                let signature = reader.get_string()?.to_vec();
                krl.signatures.push(KrlSignature {
                    key,
                    signature,
                    signed_len,
                });
                continue;
            }
            if !krl.signatures.is_empty() {
                return Err(KrlError::TrailingData);
            }

            let body = reader.get_string()?;
            match section_type {
                KRL_SECTION_CERTIFICATES => krl.certificates.push(CertificateSection::parse(body)?),
                KRL_SECTION_EXPLICIT_KEY => read_blobs(body, &mut krl.explicit_keys)?,
                KRL_SECTION_FINGERPRINT_SHA1 => read_blobs(body, &mut krl.sha1_fingerprints)?,
                KRL_SECTION_FINGERPRINT_SHA256 => {
                    read_blobs(body, &mut krl.sha256_fingerprints)?
                }
                other => return Err(KrlError::UnknownSection(other)),
            }
        }

        krl.raw = data.to_vec();
        Ok(krl)
    }

    /// Reports whether `cert` is revoked by this list.
    ///
    /// A certificate is revoked when its serial or key id is listed for its CA, or when either
    /// the certificate's own key or its CA key is revoked outright.
    pub fn is_revoked(&self, cert: &Certificate) -> bool {
        let ca_key = PublicKey::from(cert.signature_key().clone()).to_bytes().ok();
        let subject_key = PublicKey::from(cert.public_key().clone()).to_bytes().ok();

        if [&ca_key, &subject_key]
            .into_iter()
            .flatten()
            .any(|blob| self.is_key_revoked(blob))
        {
            return true;
        }
        self.certificates
            .iter()
            .any(|section| section.matches(ca_key.as_deref(), cert))
    }

    fn is_key_revoked(&self, blob: &[u8]) -> bool {
        self.explicit_keys.contains(blob)
            || self.sha1_fingerprints.contains(Sha1::digest(blob).as_slice())
            || self.sha256_fingerprints.contains(Sha256::digest(blob).as_slice())
    }

    /// Checks every signature embedded in the list.
    ///
    /// Returns `Ok(true)` if all signatures are valid and one of them was made by `ca_key`,
    /// `Ok(false)` if the list is unsigned or only signed by other keys, and an error if any
    /// signature fails to verify.
    pub fn verify(&self, ca_key: &PublicKey) -> Result<bool, KrlError> {
        let ca_blob = ca_key.to_bytes()?;
        let mut signed_by_ca = false;
        for entry in &self.signatures {
            let key = PublicKey::from_bytes(&entry.key)?;
            let signature = decode_signature(&entry.signature)?;
            Verifier::verify(&key, &self.raw[..entry.signed_len], &signature)?;
            signed_by_ca |= entry.key == ca_blob;
        }
        Ok(signed_by_ca)
    }

    /// Number of signatures embedded in the list.
    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }
}

fn read_blobs(body: &[u8], into: &mut BTreeSet<Vec<u8>>) -> Result<(), KrlError> {
    let mut reader = KrlReader::new(body);
    while !reader.is_empty() {
        into.insert(reader.get_string()?.to_vec());
    }
    Ok(())
}

fn decode_signature(blob: &[u8]) -> Result<Signature, KrlError> {
    let mut reader = KrlReader::new(blob);
    let algorithm = Algorithm::new(&reader.get_utf8()?)?;
    let data = reader.get_string()?;
    Ok(Signature::new(algorithm, data.to_vec())?)
}
