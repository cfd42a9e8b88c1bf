//! File hashing helpers shared by the cache pipeline and the self-upgrade
//! controller.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use anyhow::{Context, Result};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Streams `path` through SHA-256 and returns a lowercase 64-hex-char digest.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    copy_into(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Streams `path` through SHA-1. Exposed for parity with the wire protocol's
/// secondary digest; not used by any verification step in this revision.
pub fn sha1_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha1::new();
    copy_into(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn copy_into(file: &mut File, hasher: &mut impl Digest) -> Result<()> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

/// The `.sha256` sibling files may be `"<hex>\n"` or `"<hex>  <name>\n"`;
/// only the first whitespace-delimited token is the digest.
pub fn first_hex_token(contents: &str) -> Option<&str> {
    contents.split_whitespace().next()
}

/// Compares the SHA-256 of `path` against the trimmed first token of
/// `expected_contents` (the raw contents of a `.sha256` sibling file).
pub fn verify_checksum(path: &Path, expected_contents: &str) -> Result<bool> {
    let expected =
        first_hex_token(expected_contents).ok_or_else(|| io::Error::other("empty .sha256 file"))?;
    let got = sha256_file(path)?;
    Ok(expected.eq_ignore_ascii_case(&got))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn sha256_matches_known_vector() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"abc").unwrap();
        f.flush().unwrap();
        let digest = sha256_file(f.path()).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn checksum_file_with_trailing_filename_is_accepted() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        f.flush().unwrap();
        let digest = sha256_file(f.path()).unwrap();
        let sibling = format!("{digest}  hello.bin\n");
        assert!(verify_checksum(f.path(), &sibling).unwrap());
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        f.flush().unwrap();
        assert!(!verify_checksum(f.path(), "0000000000000000000000000000000000000000000000000000000000000000\n").unwrap());
    }
}
