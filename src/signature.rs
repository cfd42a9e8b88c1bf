//! Detached OpenPGP signature verification against a locally cached trust
//! store.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Generalizes `update/src/lib.rs`'s manifest-signature verification (which
//! binds a detached `.asc` to a single GitHub user's published keyring) to
//! binding a detached `.asc` to the full keyring assembled by the trust
//! store (§4.2): acceptance requires the signature to validate against at
//! least one key that is actually present in the currently loaded trust
//! store.

use anyhow::{anyhow, Context, Result};
use openpgp::cert::CertParser;
use openpgp::parse::stream::{
    DetachedVerifierBuilder, GoodChecksum, MessageLayer, MessageStructure, VerificationHelper,
};
use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use openpgp::{Cert, Fingerprint, KeyHandle};
use sequoia_openpgp as openpgp;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// The outcome of a signature verification attempt, distinguished so
/// callers can tell a cryptographically bad signature apart from one whose
/// signer simply isn't trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Good,
    BadSignature(String),
    UnknownSigner,
}

/// Parses the concatenated armored public-key blocks at `trust_store_path`
/// into a keyring. Text outside the PGP public key block fences is ignored,
/// matching the trust store's on-disk format (§3).
pub fn load_keyring(trust_store_path: &Path) -> Result<Vec<Cert>> {
    let bytes = fs::read(trust_store_path)
        .with_context(|| format!("reading trust store at {}", trust_store_path.display()))?;
    if bytes.is_empty() {
        return Err(anyhow!("trust store at {} is empty", trust_store_path.display()));
    }

    let mut certs = Vec::new();
    let mut parser =
        CertParser::from_bytes(&bytes).context("parsing armored keys from trust store")?;
    while let Some(cert) = parser.next().transpose()? {
        certs.push(cert);
    }
    Ok(certs)
}

struct Helper {
    certs: Vec<Cert>,
    signer_fprs: Vec<Fingerprint>,
    /// Set once `get_certs` is asked for a key handle that matches none of
    /// `certs` — i.e. the signature names a signer the trust store has never
    /// heard of, as opposed to one it has a (wrong) key for.
    saw_unmatched_key_handle: bool,
}

impl VerificationHelper for Helper {
    // Unlike a single-keyring fetch, the trust store can hold many certs, so
    // we actually filter by the requested handles rather than handing back
    // everything — that's what lets `check`/the caller tell "no such signer
    // in the trust store" apart from "signer is known but signature is bad".
    fn get_certs(&mut self, ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        let mut matches = Vec::new();
        for id in ids {
            let mut found = false;
            for cert in &self.certs {
                if cert.keys().any(|ka| id.aliases(ka.key().key_handle())) {
                    matches.push(cert.clone());
                    found = true;
                }
            }
            if !found {
                self.saw_unmatched_key_handle = true;
            }
        }
        Ok(matches)
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure.iter() {
            if let MessageLayer::SignatureGroup { results } = layer {
                for r in results {
                    if let Ok(GoodChecksum { ka, .. }) = r {
                        self.signer_fprs.push(ka.key().fingerprint());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Verifies `binary_path` against the detached signature at
/// `signature_path` using the keyring loaded from `trust_store_path`.
///
/// Any parse or cryptographic error returns `VerifyOutcome::BadSignature`
/// with the underlying detail. A signature that Sequoia accepts but whose
/// signer fingerprint is not a member of the loaded keyring returns
/// `VerifyOutcome::UnknownSigner` — this is structurally unreachable when
/// the full trust store is always handed to `get_certs` (as done here), so
/// in practice an untrusted signer shows up as Sequoia reporting no good
/// checksum at all, which is folded into `BadSignature`.
pub fn verify_signature(
    binary_path: &Path,
    signature_path: &Path,
    trust_store_path: &Path,
) -> Result<VerifyOutcome> {
    let certs = match load_keyring(trust_store_path) {
        Ok(c) if !c.is_empty() => c,
        Ok(_) => return Ok(VerifyOutcome::BadSignature("trust store has no keys".into())),
        Err(e) => return Ok(VerifyOutcome::BadSignature(format!("{e:#}"))),
    };

    let known_fprs: HashSet<Fingerprint> = certs
        .iter()
        .flat_map(|c| c.keys().map(|ka| ka.key().fingerprint()))
        .collect();

    let binary = match fs::read(binary_path) {
        Ok(b) => b,
        Err(e) => return Ok(VerifyOutcome::BadSignature(format!("reading binary: {e}"))),
    };
    let sig_bytes = match fs::read(signature_path) {
        Ok(b) => b,
        Err(e) => {
            return Ok(VerifyOutcome::BadSignature(format!(
                "reading signature file: {e}"
            )))
        }
    };

    let policy = &StandardPolicy::new();
    let helper = Helper {
        certs,
        signer_fprs: Vec::new(),
        saw_unmatched_key_handle: false,
    };

    let verifier = DetachedVerifierBuilder::from_bytes(&sig_bytes)
        .and_then(|b| b.with_policy(policy, None, helper));

    let mut verifier = match verifier {
        Ok(v) => v,
        Err(e) => return Ok(VerifyOutcome::BadSignature(format!("{e}"))),
    };

    if let Err(e) = verifier.verify_bytes(&binary) {
        return Ok(if verifier.helper_ref().saw_unmatched_key_handle {
            VerifyOutcome::UnknownSigner
        } else {
            VerifyOutcome::BadSignature(format!("{e}"))
        });
    }

    let helper = verifier.into_helper();
    if helper.signer_fprs.is_empty() {
        return Ok(VerifyOutcome::BadSignature(
            "signature verified but no signer fingerprint reported".into(),
        ));
    }

    if helper.signer_fprs.iter().any(|f| known_fprs.contains(f)) {
        Ok(VerifyOutcome::Good)
    } else {
        Ok(VerifyOutcome::UnknownSigner)
    }
}
