//! Cache & Verifier Pipeline: the user-home cache of tool binaries plus
//! the online/offline verification paths that produce a trusted local
//! path or fail.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::DbtError;
use crate::hash::{sha256_file, verify_checksum};
use crate::repo::RepositoryIndex;
use crate::signature::{verify_signature, VerifyOutcome};
use crate::transport::Transport;
use crate::version::Version;
use anyhow::{Context, Result};
use log::{debug, info};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// The three sibling paths a cache entry occupies on disk.
pub struct CacheEntry {
    pub binary: PathBuf,
    pub checksum: PathBuf,
    pub signature: PathBuf,
}

impl CacheEntry {
    fn for_tool(home: &Path, name: &str) -> Self {
        let dir = home.join(".dbt").join("tools");
        Self {
            binary: dir.join(name),
            checksum: dir.join(format!("{name}.sha256")),
            signature: dir.join(format!("{name}.asc")),
        }
    }

    fn exists_complete(&self) -> bool {
        self.binary.exists() && self.checksum.exists() && self.signature.exists()
    }

    /// The version-suffixed history siblings `plan_purge`/`execute_purge`
    /// operate over. The "current" triple (`for_tool`) is what every
    /// verify/offline path reads and writes, matching spec.md §3/§6
    /// verbatim; these additional siblings are bookkeeping so that
    /// `purge(older_than, keep_n)` has real per-version history to act on
    /// once more than one version of a tool has ever been fetched.
    fn for_tool_version(home: &Path, name: &str, version: &Version) -> Self {
        let dir = home.join(".dbt").join("tools");
        let stem = format!("{name}-{version}");
        Self {
            binary: dir.join(&stem),
            checksum: dir.join(format!("{stem}.sha256")),
            signature: dir.join(format!("{stem}.asc")),
        }
    }
}

/// Writes `bytes` to `path` atomically: via a sibling `.tmp-<pid>` file
/// and a rename, falling back to copy-then-remove-then-rename if the
/// direct rename crosses filesystems (EXDEV).
fn write_atomic(path: &Path, bytes: &[u8], mode: Option<u32>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;

    #[cfg(unix)]
    if let Some(mode) = mode {
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))
            .with_context(|| format!("setting mode on {}", tmp.display()))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            fs::copy(&tmp, path).with_context(|| format!("copying into {}", path.display()))?;
            fs::remove_file(&tmp).with_context(|| format!("removing {}", tmp.display()))?;
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("installing {}", path.display())),
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

/// Runs the cache/verify contract for `(name, version_or_latest)`.
pub struct CachePipeline<'a> {
    home: &'a Path,
    transport: &'a dyn Transport,
    trust_store_path: &'a Path,
}

impl<'a> CachePipeline<'a> {
    pub fn new(home: &'a Path, transport: &'a dyn Transport, trust_store_path: &'a Path) -> Self {
        Self {
            home,
            transport,
            trust_store_path,
        }
    }

    /// The online path (§4.6 steps 1-6): resolve, verify-before-download,
    /// download on mismatch, verify checksum, verify signature.
    pub fn fetch_online(
        &self,
        index: &RepositoryIndex,
        name: &str,
        requested: Option<&Version>,
        os: &str,
        arch: &str,
    ) -> Result<PathBuf> {
        let version = index.resolve_version(name, requested)?;
        let urls = index.resolve(name, &version, os, arch)?;
        let entry = CacheEntry::for_tool(self.home, name);

        let remote_checksum = self
            .transport
            .get(&urls.checksum_url)
            .with_context(|| format!("fetching checksum for {name}@{version}"))?;
        let remote_checksum_text = String::from_utf8_lossy(&remote_checksum).to_string();

        let needs_download = if entry.binary.exists() {
            !verify_checksum(&entry.binary, &remote_checksum_text).unwrap_or(false)
        } else {
            true
        };

        if needs_download {
            debug!("downloading {name}@{version}");
            let binary = self
                .transport
                .get_binary(&urls.binary_url)
                .with_context(|| format!("downloading {name}@{version}"))?;
            let signature = self
                .transport
                .get(&urls.signature_url)
                .map_err(|e| DbtError::SignatureInvalid {
                    what: format!("{name}@{version}"),
                    detail: format!("fetching .asc: {e}"),
                })?;

            write_atomic(&entry.binary, &binary, Some(0o755))?;
            write_atomic(&entry.checksum, remote_checksum.as_slice(), None)?;
            write_atomic(&entry.signature, &signature, None)?;
        } else {
            info!("{name}@{version} already verified against remote checksum, skipping download");
            // still refresh the signature sibling so it matches the remote
            let signature = self
                .transport
                .get(&urls.signature_url)
                .map_err(|e| DbtError::SignatureInvalid {
                    what: format!("{name}@{version}"),
                    detail: format!("fetching .asc: {e}"),
                })?;
            write_atomic(&entry.signature, &signature, None)?;
            write_atomic(&entry.checksum, remote_checksum.as_slice(), None)?;
        }

        let path = self.verify_entry(&entry, name, &version)?;
        self.snapshot_version_history(&entry, name, &version);
        Ok(path)
    }

    /// Best-effort copy of the just-verified "current" triple into its
    /// version-suffixed history siblings (see `CacheEntry::for_tool_version`).
    /// Never fails the fetch: history bookkeeping is not part of the
    /// verified-exec invariant, only of `purge`'s ability to act on it.
    fn snapshot_version_history(&self, entry: &CacheEntry, name: &str, version: &Version) {
        let history = CacheEntry::for_tool_version(self.home, name, version);
        for (src, dst) in [
            (&entry.binary, &history.binary),
            (&entry.checksum, &history.checksum),
            (&entry.signature, &history.signature),
        ] {
            if let Err(e) = fs::copy(src, dst) {
                debug!(
                    "not fatal: failed to snapshot {} into version history at {}: {e}",
                    src.display(),
                    dst.display()
                );
            }
        }
    }

    /// The offline path: use whatever is already cached, failing with
    /// `ToolNotAvailable` if the entry is missing or incomplete.
    pub fn fetch_offline(&self, name: &str, requested: Option<&Version>) -> Result<PathBuf> {
        let entry = CacheEntry::for_tool(self.home, name);
        if !entry.exists_complete() {
            return Err(DbtError::ToolNotAvailable {
                name: name.to_string(),
                version: requested.map(|v| v.to_string()).unwrap_or_else(|| "latest".to_string()),
            }
            .into());
        }
        let version = requested.cloned().unwrap_or(Version::new(0, 0, 0));
        self.verify_entry(&entry, name, &version)
    }

    fn verify_entry(&self, entry: &CacheEntry, name: &str, version: &Version) -> Result<PathBuf> {
        let checksum_contents = fs::read_to_string(&entry.checksum)
            .with_context(|| format!("reading {}", entry.checksum.display()))?;
        let ok = verify_checksum(&entry.binary, &checksum_contents)?;
        if !ok {
            let got = sha256_file(&entry.binary)?;
            return Err(DbtError::ChecksumMismatch {
                what: format!("{name}@{version}"),
                expected: checksum_contents.trim().to_string(),
                got,
            }
            .into());
        }

        match verify_signature(&entry.binary, &entry.signature, self.trust_store_path)? {
            VerifyOutcome::Good => Ok(entry.binary.clone()),
            VerifyOutcome::BadSignature(detail) => Err(DbtError::SignatureInvalid {
                what: format!("{name}@{version}"),
                detail,
            }
            .into()),
            VerifyOutcome::UnknownSigner => Err(DbtError::SignatureInvalid {
                what: format!("{name}@{version}"),
                detail: "signing key not present in trust store".to_string(),
            }
            .into()),
        }
    }
}

/// Policy for `purge`: which versions of a tool's cache entries to delete.
pub struct PurgePolicy {
    pub all: bool,
    pub older_than: Option<SystemTime>,
    pub keep_n: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct PurgePlan {
    pub keep: Vec<PathBuf>,
    pub delete: Vec<PathBuf>,
}

/// Enumerates a tool's on-disk versioned entries and partitions them by
/// `policy`, honoring the `keep_n` floor before the age threshold.
///
/// The single-entry cache layout (`<name>`, no version directory) means a
/// "versions on disk" enumeration only applies when callers keep
/// version-suffixed siblings; this purges by that convention
/// (`<name>-<version>{,.sha256,.asc}`), leaving the unversioned "current"
/// entry alone unless `policy.all` is set.
///
/// Grouped by `Version`, not by individual file: each version can own up to
/// three sibling files (binary, `.sha256`, `.asc`), and `keep_n`/`older_than`
/// are a per-version floor/threshold, not a per-file one — partitioning
/// file-by-file could keep a version's binary while deleting its signature.
pub fn plan_purge(home: &Path, name: &str, policy: &PurgePolicy) -> Result<PurgePlan> {
    let dir = home.join(".dbt").join("tools");
    let mut by_version: std::collections::BTreeMap<Version, (Vec<PathBuf>, SystemTime)> =
        std::collections::BTreeMap::new();

    if dir.is_dir() {
        for entry in fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(rest) = file_name.strip_prefix(&format!("{name}-")) else {
                continue;
            };
            let version_str = rest
                .strip_suffix(".sha256")
                .or_else(|| rest.strip_suffix(".asc"))
                .unwrap_or(rest);
            let Ok(version) = version_str.parse::<Version>() else {
                continue;
            };
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or_else(|_| SystemTime::now());
            let slot = by_version
                .entry(version)
                .or_insert_with(|| (Vec::new(), modified));
            slot.0.push(entry.path());
            if modified > slot.1 {
                slot.1 = modified;
            }
        }
    }

    if policy.all {
        let entry = CacheEntry::for_tool(home, name);
        let mut delete: Vec<PathBuf> = by_version
            .into_values()
            .flat_map(|(paths, _)| paths)
            .collect();
        delete.extend([entry.binary, entry.checksum, entry.signature]);
        return Ok(PurgePlan {
            keep: Vec::new(),
            delete,
        });
    }

    let mut versions: Vec<(Version, Vec<PathBuf>, SystemTime)> = by_version
        .into_iter()
        .map(|(version, (paths, modified))| (version, paths, modified))
        .collect();
    versions.sort_by(|a, b| b.0.cmp(&a.0));

    let mut keep = Vec::new();
    let mut delete = Vec::new();
    for (i, (_, paths, modified)) in versions.into_iter().enumerate() {
        let keep_this = if i < policy.keep_n {
            true
        } else {
            match policy.older_than {
                Some(threshold) => modified >= threshold,
                None => false,
            }
        };
        if keep_this {
            keep.extend(paths);
        } else {
            delete.extend(paths);
        }
    }

    Ok(PurgePlan { keep, delete })
}

pub fn execute_purge(plan: &PurgePlan, dry_run: bool) -> Result<()> {
    if dry_run {
        return Ok(());
    }
    for path in &plan.delete {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use std::collections::HashMap;

    #[test]
    fn write_atomic_produces_no_tmp_leftover() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("binary");
        write_atomic(&target, b"payload", Some(0o755)).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"payload");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn offline_fetch_fails_when_cache_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new(HashMap::new());
        let trust_store = dir.path().join("truststore");
        let pipeline = CachePipeline::new(dir.path(), &transport, &trust_store);
        let result = pipeline.fetch_offline("foo", None);
        assert!(result.is_err());
    }

    #[test]
    fn purge_keeps_at_least_keep_n_versions() {
        let dir = tempfile::tempdir().unwrap();
        let tools_dir = dir.path().join(".dbt").join("tools");
        fs::create_dir_all(&tools_dir).unwrap();
        for v in ["1.0.0", "1.1.0", "1.2.0", "2.0.0"] {
            fs::write(tools_dir.join(format!("foo-{v}")), b"x").unwrap();
        }

        let policy = PurgePolicy {
            all: false,
            older_than: Some(SystemTime::now() + std::time::Duration::from_secs(3600)),
            keep_n: 2,
            dry_run: false,
        };
        let plan = plan_purge(dir.path(), "foo", &policy).unwrap();
        assert!(plan.keep.len() >= 2);
    }

    #[test]
    fn history_snapshot_feeds_purge_partitioning() {
        // Exercises the seam between `fetch_online`'s bookkeeping and
        // `plan_purge` directly, without going through full checksum/signature
        // verification: write the "current" triple as fetch_online would after
        // a successful verify, snapshot it under two versions, then confirm
        // `plan_purge` sees both and applies the keep_n floor to the newest.
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new(HashMap::new());
        let trust_store = dir.path().join("truststore");
        let pipeline = CachePipeline::new(dir.path(), &transport, &trust_store);
        let entry = CacheEntry::for_tool(dir.path(), "foo");

        fs::create_dir_all(entry.binary.parent().unwrap()).unwrap();
        fs::write(&entry.binary, b"foo v1").unwrap();
        fs::write(&entry.checksum, b"deadbeef").unwrap();
        fs::write(&entry.signature, b"sig-v1").unwrap();
        pipeline.snapshot_version_history(&entry, "foo", &"1.0.0".parse().unwrap());

        fs::write(&entry.binary, b"foo v2").unwrap();
        fs::write(&entry.checksum, b"cafef00d").unwrap();
        fs::write(&entry.signature, b"sig-v2").unwrap();
        pipeline.snapshot_version_history(&entry, "foo", &"2.0.0".parse().unwrap());

        let v1 = CacheEntry::for_tool_version(dir.path(), "foo", &"1.0.0".parse().unwrap());
        let v2 = CacheEntry::for_tool_version(dir.path(), "foo", &"2.0.0".parse().unwrap());
        assert_eq!(fs::read(&v1.binary).unwrap(), b"foo v1");
        assert_eq!(fs::read(&v2.binary).unwrap(), b"foo v2");

        let policy = PurgePolicy {
            all: false,
            older_than: None,
            keep_n: 1,
            dry_run: false,
        };
        let plan = plan_purge(dir.path(), "foo", &policy).unwrap();
        assert!(plan.keep.contains(&v2.binary), "newest version stays under the keep_n floor");
        assert!(plan.delete.contains(&v1.binary), "older version is a purge candidate");
        assert!(plan.delete.contains(&v1.checksum));
        assert!(plan.delete.contains(&v1.signature));
    }

    #[test]
    fn purge_all_deletes_current_entry_too() {
        let dir = tempfile::tempdir().unwrap();
        let entry = CacheEntry::for_tool(dir.path(), "foo");
        fs::create_dir_all(entry.binary.parent().unwrap()).unwrap();
        fs::write(&entry.binary, b"x").unwrap();
        fs::write(&entry.checksum, b"x").unwrap();
        fs::write(&entry.signature, b"x").unwrap();

        let policy = PurgePolicy {
            all: true,
            older_than: None,
            keep_n: 0,
            dry_run: false,
        };
        let plan = plan_purge(dir.path(), "foo", &policy).unwrap();
        assert!(plan.delete.contains(&entry.binary));
    }
}
