//! Repository Index: tool and launcher URL resolution against a server's
//! tools-base or dbt-base URL.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::DbtError;
use crate::transport::Transport;
use crate::version::{parse_version_set, Version};
use anyhow::Result;

/// The launcher's own name segment in the wire layout, fixed regardless of
/// the binary's actual filename on disk.
pub const DBT_NAME: &str = "dbt";

pub struct ResolvedUrls {
    pub binary_url: String,
    pub checksum_url: String,
    pub signature_url: String,
    pub description_url: Option<String>,
}

/// Looks up tool/launcher versions and resolves their download URLs
/// against a server's configured tools-base or dbt-base URL.
pub struct RepositoryIndex<'a> {
    transport: &'a dyn Transport,
    base_url: &'a str,
}

impl<'a> RepositoryIndex<'a> {
    pub fn for_tools(transport: &'a dyn Transport, tools_base_url: &'a str) -> Self {
        Self {
            transport,
            base_url: tools_base_url,
        }
    }

    pub fn for_launcher(transport: &'a dyn Transport, dbt_base_url: &'a str) -> Self {
        Self {
            transport,
            base_url: dbt_base_url,
        }
    }

    fn tool_dir_url(&self, name: &str) -> String {
        if name == DBT_NAME {
            self.base_url.trim_end_matches('/').to_string()
        } else {
            format!("{}/{name}", self.base_url.trim_end_matches('/'))
        }
    }

    pub fn tool_exists(&self, name: &str) -> Result<bool> {
        Ok(!self.versions(name)?.is_empty())
    }

    pub fn versions(&self, name: &str) -> Result<Vec<Version>> {
        let url = self.tool_dir_url(name);
        self.transport.list_versions(&url)
    }

    pub fn latest(&self, name: &str) -> Result<Option<Version>> {
        Ok(Version::latest(&self.versions(name)?))
    }

    /// Resolves every wire artifact for `(name, version, os, arch)`. The
    /// optional `description.txt` sibling is checked but its absence is
    /// never an error — it is consumed only by the out-of-scope catalog
    /// tool.
    pub fn resolve(
        &self,
        name: &str,
        version: &Version,
        os: &str,
        arch: &str,
    ) -> Result<ResolvedUrls> {
        let dir = format!("{}/{version}/{os}/{arch}", self.tool_dir_url(name));
        let binary_url = format!("{dir}/{name}");
        let checksum_url = format!("{binary_url}.sha256");
        let signature_url = format!("{binary_url}.asc");
        let candidate_description_url = format!("{}/{version}/description.txt", self.tool_dir_url(name));

        let description_url = match self.transport.exists(&candidate_description_url) {
            Ok(true) => Some(candidate_description_url),
            _ => None,
        };

        Ok(ResolvedUrls {
            binary_url,
            checksum_url,
            signature_url,
            description_url,
        })
    }

    /// Resolves `name`'s requested version, or its latest if unspecified.
    /// Errors with `ToolNotFound` if the tool has no published versions,
    /// or the requested version isn't among them.
    pub fn resolve_version(&self, name: &str, requested: Option<&Version>) -> Result<Version> {
        let published = self.versions(name)?;
        match requested {
            Some(v) => {
                if published.contains(v) {
                    Ok(v.clone())
                } else {
                    Err(DbtError::ToolNotFound {
                        name: name.to_string(),
                        version: v.to_string(),
                    }
                    .into())
                }
            }
            None => Version::latest(&published).ok_or_else(|| {
                DbtError::ToolNotFound {
                    name: name.to_string(),
                    version: "latest".to_string(),
                }
                .into()
            }),
        }
    }
}

/// Filters a raw candidate name list down to the versions it parses as,
/// exposed for backends (like the S3 listing path) that gather names
/// outside an HTML anchor set.
pub fn filter_versions(names: &[String]) -> Vec<Version> {
    parse_version_set(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use std::collections::HashMap;

    fn transport_with_listing(url: &str, body: &str) -> MockTransport {
        let mut bodies = HashMap::new();
        bodies.insert(url.to_string(), body.as_bytes().to_vec());
        MockTransport::new(bodies)
    }

    #[test]
    fn latest_picks_max_under_triple_order() {
        let html = r#"<a href="1.0.0/">1.0.0/</a><a href="2.0.0/">2.0.0/</a><a href="1.9.9/">1.9.9/</a>"#;
        let transport = transport_with_listing("https://repo.example/tools/foo", html);
        let index = RepositoryIndex::for_tools(&transport, "https://repo.example/tools");
        let latest = index.latest("foo").unwrap();
        assert_eq!(latest, Some("2.0.0".parse().unwrap()));
    }

    #[test]
    fn resolve_version_errors_on_unpublished_pin() {
        let html = r#"<a href="1.0.0/">1.0.0/</a>"#;
        let transport = transport_with_listing("https://repo.example/tools/foo", html);
        let index = RepositoryIndex::for_tools(&transport, "https://repo.example/tools");
        let result = index.resolve_version("foo", Some(&"9.9.9".parse().unwrap()));
        assert!(result.is_err());
    }

    #[test]
    fn launcher_resolution_uses_dbt_base_directly() {
        let transport = MockTransport::new(HashMap::new());
        let index = RepositoryIndex::for_launcher(&transport, "https://repo.example/dbt");
        let resolved = index
            .resolve(DBT_NAME, &"3.1.4".parse().unwrap(), "linux", "amd64")
            .unwrap();
        assert_eq!(
            resolved.binary_url,
            "https://repo.example/dbt/3.1.4/linux/amd64/dbt"
        );
        assert_eq!(resolved.description_url, None);
    }
}
