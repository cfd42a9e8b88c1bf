//! Trust store: the on-disk cache of concatenated armored OpenPGP public
//! keys used to verify every detached signature in this invocation.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::ServerConfig;
use crate::transport::Transport;
use anyhow::{Context, Result};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

pub struct TrustStore {
    home: PathBuf,
}

impl TrustStore {
    pub fn new(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
        }
    }

    /// `<home>/.dbt/trust/truststore`
    pub fn path(&self) -> PathBuf {
        self.home.join(".dbt").join("trust").join("truststore")
    }

    /// Issues an authenticated GET against `server.truststore_url`. On a
    /// non-empty 2xx body, atomically overwrites the on-disk trust store.
    /// On an empty body, leaves the existing file untouched (this guards
    /// against a server-side bug that would otherwise truncate trust to
    /// nothing). Any other outcome is a fatal error in online mode.
    pub fn refresh(&self, transport: &dyn Transport, server: &ServerConfig) -> Result<()> {
        debug!("refreshing trust store from {}", server.truststore_url);
        let bytes = transport
            .get(&server.truststore_url)
            .with_context(|| format!("fetching trust store from {}", server.truststore_url))?;

        if bytes.is_empty() {
            warn!(
                "trust store refresh from {} returned an empty body; keeping existing trust store",
                server.truststore_url
            );
            return Ok(());
        }

        let path = self.path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating trust dir {}", parent.display()))?;
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("installing {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use std::collections::HashMap;

    fn server(url: &str) -> ServerConfig {
        ServerConfig {
            base_url: "https://repo.example/dbt".into(),
            truststore_url: url.into(),
            tools_url: "https://repo.example/tools".into(),
            credentials: Default::default(),
            oidc: None,
        }
    }

    #[test]
    fn refresh_overwrites_on_non_empty_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::new(dir.path());
        let mut bodies = HashMap::new();
        bodies.insert(
            "https://repo.example/truststore".to_string(),
            b"-----BEGIN PGP PUBLIC KEY BLOCK-----\n...\n-----END PGP PUBLIC KEY BLOCK-----\n"
                .to_vec(),
        );
        let transport = MockTransport::new(bodies);

        store
            .refresh(&transport, &server("https://repo.example/truststore"))
            .unwrap();
        let contents = fs::read(store.path()).unwrap();
        assert!(!contents.is_empty());
    }

    #[test]
    fn refresh_keeps_existing_file_on_empty_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::new(dir.path());
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"existing-keyring").unwrap();

        let mut bodies = HashMap::new();
        bodies.insert("https://repo.example/truststore".to_string(), Vec::new());
        let transport = MockTransport::new(bodies);

        store
            .refresh(&transport, &server("https://repo.example/truststore"))
            .unwrap();
        assert_eq!(fs::read(store.path()).unwrap(), b"existing-keyring");
    }

    #[test]
    fn refresh_fails_on_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::new(dir.path());
        let transport = MockTransport::new(HashMap::new());

        let result = store.refresh(&transport, &server("https://repo.example/missing"));
        assert!(result.is_err());
    }
}
