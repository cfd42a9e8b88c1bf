//! Self-Upgrade Controller: is the running launcher current, and if not,
//! replace it in place before re-exec.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Generalizes `update/src/lib.rs`'s `download_and_verify_component`
//! (release-policy check, checksum, detached signature, atomic install)
//! from a GitHub-release manifest to the dbt trust store and
//! `dbt.sha256`/`dbt.asc` siblings.

use crate::error::DbtError;
use crate::hash::{sha256_file, verify_checksum};
use crate::repo::{RepositoryIndex, DBT_NAME};
use crate::signature::{verify_signature, VerifyOutcome};
use crate::transport::Transport;
use crate::version::Version;
use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Compares the running binary's SHA-256 against the remote `.sha256` for
/// the latest published launcher. Returns `Ok(false)` on a definite
/// mismatch, `Ok(true)` on a match, and an error (never `false`) if the
/// remote `.sha256` can't be fetched — the caller must not upgrade into
/// an unknown state.
pub fn is_current(
    index: &RepositoryIndex,
    transport: &dyn Transport,
    current_binary_path: &Path,
    os: &str,
    arch: &str,
) -> Result<bool> {
    let latest = index
        .latest(DBT_NAME)?
        .ok_or_else(|| DbtError::Network {
            url: "launcher version listing".to_string(),
            detail: "no published launcher versions found".to_string(),
        })?;
    let urls = index.resolve(DBT_NAME, &latest, os, arch)?;

    let remote_checksum = transport
        .get(&urls.checksum_url)
        .with_context(|| format!("fetching launcher checksum from {}", urls.checksum_url))?;
    let remote_checksum_text = String::from_utf8_lossy(&remote_checksum).to_string();

    let current_sha = sha256_file(current_binary_path)?;
    let matches = crate::hash::first_hex_token(&remote_checksum_text)
        .map(|expected| expected.eq_ignore_ascii_case(&current_sha))
        .unwrap_or(false);
    Ok(matches)
}

/// Downloads the latest launcher into a temp directory, verifies checksum
/// then signature, and only then atomically installs over
/// `current_binary_path`. The temp directory is removed on every exit
/// path, and a failed verification leaves the running image untouched.
pub fn upgrade(
    index: &RepositoryIndex,
    transport: &dyn Transport,
    trust_store_path: &Path,
    current_binary_path: &Path,
    os: &str,
    arch: &str,
) -> Result<Version> {
    let latest = index
        .latest(DBT_NAME)?
        .ok_or_else(|| DbtError::Upgrade("no published launcher versions found".to_string()))?;
    let urls = index.resolve(DBT_NAME, &latest, os, arch)?;

    let tmp_dir = tempfile::tempdir().context("creating self-upgrade temp directory")?;
    let result = (|| -> Result<Version> {
        let binary = transport
            .get_binary(&urls.binary_url)
            .with_context(|| format!("downloading launcher {latest}"))?;
        let checksum = transport
            .get(&urls.checksum_url)
            .with_context(|| format!("downloading launcher checksum for {latest}"))?;
        let signature = transport.get(&urls.signature_url).map_err(|e| {
            DbtError::SignatureInvalid {
                what: format!("dbt@{latest}"),
                detail: format!("fetching .asc: {e}"),
            }
        })?;

        let tmp_binary = tmp_dir.path().join("dbt");
        let tmp_checksum = tmp_dir.path().join("dbt.sha256");
        let tmp_signature = tmp_dir.path().join("dbt.asc");
        fs::write(&tmp_binary, &binary)?;
        fs::write(&tmp_checksum, &checksum)?;
        fs::write(&tmp_signature, &signature)?;

        let checksum_text = String::from_utf8_lossy(&checksum).to_string();
        if !verify_checksum(&tmp_binary, &checksum_text)? {
            let got = sha256_file(&tmp_binary)?;
            return Err(DbtError::ChecksumMismatch {
                what: format!("dbt@{latest}"),
                expected: checksum_text.trim().to_string(),
                got,
            }
            .into());
        }

        match verify_signature(&tmp_binary, &tmp_signature, trust_store_path)? {
            VerifyOutcome::Good => {}
            VerifyOutcome::BadSignature(detail) => {
                return Err(DbtError::SignatureInvalid {
                    what: format!("dbt@{latest}"),
                    detail,
                }
                .into())
            }
            VerifyOutcome::UnknownSigner => {
                return Err(DbtError::SignatureInvalid {
                    what: format!("dbt@{latest}"),
                    detail: "signing key not present in trust store".to_string(),
                }
                .into())
            }
        }

        #[cfg(unix)]
        fs::set_permissions(&tmp_binary, fs::Permissions::from_mode(0o755))?;

        install_over(&tmp_binary, current_binary_path)?;
        info!("self-upgraded to dbt {latest}");
        Ok(latest)
    })();

    result
}

/// Installs `verified_binary` over `current_binary_path` via rename so a
/// concurrently-running second launcher invocation never observes a
/// half-written image (§5). When the temp directory and the cache/binary
/// directory are on different filesystems, `rename` fails with `EXDEV`;
/// the fallback copies onto a same-filesystem sibling of the target first,
/// then renames that sibling into place, so the final publish step is
/// still a single atomic rename.
fn install_over(verified_binary: &Path, current_binary_path: &Path) -> Result<()> {
    match fs::rename(verified_binary, current_binary_path) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            let staged = current_binary_path.with_extension(format!("tmp-{}", std::process::id()));
            fs::copy(verified_binary, &staged)
                .with_context(|| format!("staging {}", staged.display()))?;
            #[cfg(unix)]
            fs::set_permissions(&staged, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("setting mode on {}", staged.display()))?;
            fs::rename(&staged, current_binary_path)
                .with_context(|| format!("installing {}", current_binary_path.display()))?;
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("installing {}", current_binary_path.display())),
    }
}

#[cfg(unix)]
fn is_cross_device(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32)
}

#[cfg(not(unix))]
fn is_cross_device(_e: &std::io::Error) -> bool {
    false
}
