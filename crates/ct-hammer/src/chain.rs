// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! Certificate chains submitted through add-chain and add-pre-chain.
//!
//! Every submission carries a freshly signed leaf: the leaf loaded from the test data directory is
//! re-issued with a new serial number and the notAfter of the target log, so that it lands in the
//! log's temporal shard and is never deduplicated against an earlier submission.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context as _, anyhow};
use chrono::{DateTime, Utc};
use p256::{
    SecretKey,
    ecdsa::{Signature, SigningKey, signature::Signer as _},
    pkcs8::DecodePrivateKey as _,
};
use rand::RngCore as _;
use x509_cert::{
    Certificate,
    der::{
        Encode as _,
        asn1::{BitString, GeneralizedTime, OctetString, UtcTime},
    },
    ext::Extension,
    serial_number::SerialNumber,
    spki::{AlgorithmIdentifierOwned, ObjectIdentifier},
    time::Time,
};

use crate::{
    bias::{BiasWeights, Entrypoint},
    error::ConfigError,
};

/// File holding the chain whose leaf is re-issued for every submission.
pub const LEAF_CHAIN_FILE: &str = "leaf01.chain";
/// File holding the PKCS#8 or SEC1 PEM key of the leaf's issuer.
pub const SIGNER_KEY_FILE: &str = "int-ca.privkey.pem";

const ECDSA_WITH_SHA_256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const CT_PRECERT_POISON: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.11129.2.4.3");
const CT_SCT_LIST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.11129.2.4.2");
const ASN1_NULL: [u8; 2] = [0x05, 0x00];
const SERIAL_NUMBER_LEN: usize = 16;

/// The two kinds of chain a log accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    /// A final certificate followed by its issuers.
    Certificate,
    /// A precertificate followed by its issuers.
    Precertificate,
}

/// Produces the DER certificates of a chain, leaf first.
pub trait ChainGenerator: Send + Sync + fmt::Debug {
    /// Returns a chain of `kind` whose leaf expires at `not_after`.
    fn chain(&self, kind: ChainKind, not_after: DateTime<Utc>) -> anyhow::Result<Vec<Vec<u8>>>;
}

/// The leaf chain and issuer key loaded from a test data directory.
#[derive(Clone)]
pub struct ChainMaterial {
    /// The leaf used as template for submissions.
    pub leaf: Certificate,
    /// The certificates following the leaf, closest issuer first.
    pub issuers: Vec<Certificate>,
    /// The key of the leaf's issuer.
    pub signer: SigningKey,
}

impl fmt::Debug for ChainMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainMaterial")
            .field("leaf", &self.leaf.tbs_certificate.subject)
            .field("issuers", &self.issuers.len())
            .finish_non_exhaustive()
    }
}

impl ChainMaterial {
    /// Loads [`LEAF_CHAIN_FILE`] and [`SIGNER_KEY_FILE`] from `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let mut chain = read_chain_file(&dir.join(LEAF_CHAIN_FILE))?.into_iter();
        let signer = read_signer(&dir.join(SIGNER_KEY_FILE))?;
        let leaf = chain.next().ok_or_else(|| ConfigError::InvalidChain {
            path: dir.join(LEAF_CHAIN_FILE),
            reason: "no certificates found".to_owned(),
        })?;
        Ok(Self {
            leaf,
            issuers: chain.collect(),
            signer,
        })
    }
}

fn read_chain_file(path: &Path) -> Result<Vec<Certificate>, ConfigError> {
    let contents = std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    Certificate::load_pem_chain(&contents).map_err(|error| ConfigError::InvalidChain {
        path: PathBuf::from(path),
        reason: error.to_string(),
    })
}

fn read_signer(path: &Path) -> Result<SigningKey, ConfigError> {
    let pem = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    SecretKey::from_pkcs8_pem(&pem)
        .or_else(|_| SecretKey::from_sec1_pem(&pem))
        .map(SigningKey::from)
        .map_err(|error| ConfigError::InvalidSigner {
            path: path.to_owned(),
            reason: error.to_string(),
        })
}

/// Zeroes the weights of chain submissions when no chain material is available.
pub fn restrict_to_chain_material(weights: &mut BiasWeights, material: Option<&ChainMaterial>) {
    if material.is_some() {
        return;
    }
    for entrypoint in [Entrypoint::AddChain, Entrypoint::AddPreChain] {
        if weights.weight(entrypoint) > 0 {
            tracing::warn!(%entrypoint, "no chain material available, disabling entrypoint");
            weights.set_weight(entrypoint, 0);
        }
    }
}

/// Re-issues the loaded leaf for every submission.
#[derive(Debug, Clone)]
pub struct SyntheticChainGenerator {
    material: ChainMaterial,
}

impl SyntheticChainGenerator {
    /// Creates a generator signing leaves with the issuer key of `material`.
    pub fn new(material: ChainMaterial) -> Self {
        Self { material }
    }

    fn issue_leaf(&self, kind: ChainKind, not_after: DateTime<Utc>) -> anyhow::Result<Vec<u8>> {
        let mut tbs = self.material.leaf.tbs_certificate.clone();
        tbs.serial_number = fresh_serial_number()?;
        tbs.validity.not_after = certificate_time(not_after)?;
        tbs.signature = signature_algorithm();

        let mut extensions: Vec<Extension> = tbs
            .extensions
            .take()
            .unwrap_or_default()
            .into_iter()
            .filter(|extension| {
                extension.extn_id != CT_PRECERT_POISON && extension.extn_id != CT_SCT_LIST
            })
            .collect();
        if kind == ChainKind::Precertificate {
            extensions.push(Extension {
                extn_id: CT_PRECERT_POISON,
                critical: true,
                extn_value: OctetString::new(ASN1_NULL.to_vec())?,
            });
        }
        tbs.extensions = (!extensions.is_empty()).then_some(extensions);

        let signature: Signature = self
            .material
            .signer
            .try_sign(&tbs.to_der()?)
            .map_err(|error| anyhow!("failed to sign leaf: {error}"))?;
        let certificate = Certificate {
            tbs_certificate: tbs,
            signature_algorithm: signature_algorithm(),
            signature: BitString::from_bytes(signature.to_der().as_bytes())?,
        };
        Ok(certificate.to_der()?)
    }
}

impl ChainGenerator for SyntheticChainGenerator {
    fn chain(&self, kind: ChainKind, not_after: DateTime<Utc>) -> anyhow::Result<Vec<Vec<u8>>> {
        let mut chain = Vec::with_capacity(self.material.issuers.len() + 1);
        chain.push(self.issue_leaf(kind, not_after)?);
        for issuer in &self.material.issuers {
            chain.push(issuer.to_der()?);
        }
        Ok(chain)
    }
}

fn signature_algorithm() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: ECDSA_WITH_SHA_256,
        parameters: None,
    }
}

fn fresh_serial_number() -> anyhow::Result<SerialNumber> {
    let mut bytes = [0; SERIAL_NUMBER_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Positive and minimally encoded.
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    Ok(SerialNumber::new(&bytes)?)
}

/// Encodes `at` as UTCTime up to 2049 and as GeneralizedTime afterwards.
fn certificate_time(at: DateTime<Utc>) -> anyhow::Result<Time> {
    let since_epoch = u64::try_from(at.timestamp())
        .map(Duration::from_secs)
        .context("notAfter predates the Unix epoch")?;
    Ok(match UtcTime::from_unix_duration(since_epoch) {
        Ok(time) => Time::UtcTime(time),
        Err(_) => Time::GeneralTime(GeneralizedTime::from_unix_duration(since_epoch)?),
    })
}
