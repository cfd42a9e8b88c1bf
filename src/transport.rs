//! Transport: a backend-agnostic fetch surface over HTTP(S) and S3
//! virtual-host object stores, plus directory listing for version
//! discovery.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::auth::AuthProvider;
use crate::version::{parse_version_set, Version};
use anyhow::{anyhow, Context, Result};
use log::debug;
use reqwest::blocking::Client;
use std::time::Duration;

const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// A single fetch surface hiding whether a URL lands on a plain HTTP(S)
/// server or an S3 virtual-host bucket.
pub trait Transport {
    /// Fetches the full body at `url` as a metadata request (§4.4's
    /// 30-second timeout): the trust store and the `.sha256`/`.asc`
    /// siblings, never the binary itself. A non-2xx response is an error
    /// carrying the URL and status verbatim.
    fn get(&self, url: &str) -> Result<Vec<u8>>;

    /// Fetches the full body at `url` as a binary download (§4.4's
    /// 5-minute timeout). Backends with no metadata/binary distinction of
    /// their own (S3, the test double) default to the same path as `get`.
    fn get_binary(&self, url: &str) -> Result<Vec<u8>> {
        self.get(url)
    }

    /// Returns `true` if `url` resolves with a successful response,
    /// without transferring the full body.
    fn exists(&self, url: &str) -> Result<bool>;

    /// Lists the semver-looking directory entries directly under `url`,
    /// sorted as discovered (no assumed ordering — callers sort/compare
    /// as `Version` values themselves).
    fn list_versions(&self, url: &str) -> Result<Vec<Version>>;
}

fn is_s3_virtual_host(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .map(|host| {
            let parts: Vec<&str> = host.split('.').collect();
            parts.len() >= 4 && parts.contains(&"s3") && host.ends_with("amazonaws.com")
        })
        .unwrap_or(false)
}

/// Builds the concrete backend appropriate for `url`: S3 virtual-host
/// style hostnames (`*.s3.<region>.amazonaws.com`) use the S3 backend,
/// everything else uses plain HTTP(S).
pub fn backend_for(url: &str, auth: AuthProvider) -> Box<dyn Transport> {
    if is_s3_virtual_host(url) {
        Box::new(S3Transport::new(auth))
    } else {
        Box::new(HttpTransport::new(auth))
    }
}

pub struct HttpTransport {
    client: Client,
    auth: AuthProvider,
}

impl HttpTransport {
    pub fn new(auth: AuthProvider) -> Self {
        // No client-level default timeout: §4.4 mandates two different
        // bounds (30s metadata, 5min binary) depending on which of
        // `get`/`get_binary` is called, so every request sets its own.
        let client = Client::builder().build().expect("building reqwest client");
        Self { client, auth }
    }

    fn get_with_timeout(&self, url: &str, timeout: Duration) -> Result<Vec<u8>> {
        let req = self.auth.decorate(self.client.get(url).timeout(timeout));
        let resp = req.send().with_context(|| format!("fetching {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("{url} returned status {status}"));
        }
        Ok(resp.bytes().with_context(|| format!("reading body of {url}"))?.to_vec())
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<Vec<u8>> {
        debug!("GET {url}");
        self.get_with_timeout(url, METADATA_TIMEOUT)
    }

    fn get_binary(&self, url: &str) -> Result<Vec<u8>> {
        debug!("GET (binary) {url}");
        self.get_with_timeout(url, DOWNLOAD_TIMEOUT)
    }

    fn exists(&self, url: &str) -> Result<bool> {
        let req = self
            .auth
            .decorate(self.client.head(url).timeout(METADATA_TIMEOUT));
        let resp = req.send().with_context(|| format!("HEAD {url}"))?;
        Ok(resp.status().is_success())
    }

    fn list_versions(&self, url: &str) -> Result<Vec<Version>> {
        let req = self
            .auth
            .decorate(self.client.get(url).timeout(METADATA_TIMEOUT));
        let resp = req.send().with_context(|| format!("listing {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("{url} returned status {status}"));
        }
        let body = resp.text().with_context(|| format!("reading listing body of {url}"))?;
        Ok(parse_listing(&body))
    }
}

/// Parses anchor `href`s out of an HTML directory listing and keeps the
/// ones that parse as bare semver strings (trailing slash stripped).
fn parse_listing(html: &str) -> Vec<Version> {
    let document = scraper::Html::parse_document(html);
    let selector = scraper::Selector::parse("a").expect("static selector");
    let names: Vec<String> = document
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .map(|href| href.trim_end_matches('/').to_string())
        .collect();
    parse_version_set(&names)
}

/// S3 virtual-host backend. Runs all AWS SDK calls (inherently async) on
/// a single dedicated multi-thread Tokio runtime held for the lifetime of
/// the transport, so the rest of the process stays synchronous.
pub struct S3Transport {
    runtime: tokio::runtime::Runtime,
    #[allow(dead_code)]
    auth: AuthProvider,
}

impl S3Transport {
    pub fn new(auth: AuthProvider) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("building dedicated tokio runtime for S3 transport");
        Self { runtime, auth }
    }

    fn parse_bucket_and_key<'a>(&self, url: &'a str) -> Result<(String, String, String)> {
        let parsed = url::Url::parse(url).with_context(|| format!("parsing S3 URL {url}"))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow!("S3 URL {url} has no host"))?;
        let bucket = host
            .split('.')
            .next()
            .ok_or_else(|| anyhow!("S3 URL {url} has no bucket in hostname"))?
            .to_string();
        let region = host
            .split('.')
            .nth(2)
            .ok_or_else(|| anyhow!("S3 URL {url} hostname is not virtual-host style"))?
            .to_string();
        let key = parsed.path().trim_start_matches('/').to_string();
        Ok((bucket, region, key))
    }

    fn client_for(&self, region: String) -> aws_sdk_s3::Client {
        self.runtime.block_on(async move {
            let config = aws_config::from_env()
                .region(aws_config::Region::new(region))
                .load()
                .await;
            aws_sdk_s3::Client::new(&config)
        })
    }
}

impl Transport for S3Transport {
    fn get(&self, url: &str) -> Result<Vec<u8>> {
        let (bucket, region, key) = self.parse_bucket_and_key(url)?;
        let client = self.client_for(region);
        self.runtime.block_on(async move {
            let output = client
                .get_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await
                .with_context(|| format!("fetching s3://{bucket}/{key}"))?;
            let data = output
                .body
                .collect()
                .await
                .with_context(|| format!("reading s3://{bucket}/{key} body"))?;
            Ok(data.into_bytes().to_vec())
        })
    }

    fn exists(&self, url: &str) -> Result<bool> {
        let (bucket, region, key) = self.parse_bucket_and_key(url)?;
        let client = self.client_for(region);
        self.runtime.block_on(async move {
            match client.head_object().bucket(&bucket).key(&key).send().await {
                Ok(_) => Ok(true),
                Err(aws_sdk_s3::error::SdkError::ServiceError(e))
                    if e.err().is_not_found() =>
                {
                    Ok(false)
                }
                Err(e) => Err(anyhow!("checking s3://{bucket}/{key}: {e}")),
            }
        })
    }

    fn list_versions(&self, url: &str) -> Result<Vec<Version>> {
        let (bucket, region, prefix) = self.parse_bucket_and_key(url)?;
        let prefix = if prefix.ends_with('/') || prefix.is_empty() {
            prefix
        } else {
            format!("{prefix}/")
        };
        let client = self.client_for(region);
        self.runtime.block_on(async move {
            let output = client
                .list_objects_v2()
                .bucket(&bucket)
                .prefix(&prefix)
                .delimiter("/")
                .send()
                .await
                .with_context(|| format!("listing s3://{bucket}/{prefix}"))?;
            let names: Vec<String> = output
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix())
                .map(|p| {
                    p.trim_start_matches(&prefix)
                        .trim_end_matches('/')
                        .to_string()
                })
                .collect();
            Ok(parse_version_set(&names))
        })
    }
}

/// In-memory transport test double keyed by exact URL.
#[cfg(test)]
pub struct MockTransport {
    bodies: std::collections::HashMap<String, Vec<u8>>,
}

#[cfg(test)]
impl MockTransport {
    pub fn new(bodies: std::collections::HashMap<String, Vec<u8>>) -> Self {
        Self { bodies }
    }
}

#[cfg(test)]
impl Transport for MockTransport {
    fn get(&self, url: &str) -> Result<Vec<u8>> {
        self.bodies
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("{url} returned status 404"))
    }

    fn exists(&self, url: &str) -> Result<bool> {
        Ok(self.bodies.contains_key(url))
    }

    fn list_versions(&self, url: &str) -> Result<Vec<Version>> {
        self.bodies
            .get(url)
            .map(|b| {
                let names: Vec<String> = String::from_utf8_lossy(b)
                    .lines()
                    .map(|line| line.trim_end_matches('/').to_string())
                    .collect();
                parse_version_set(&names)
            })
            .ok_or_else(|| anyhow!("{url} returned status 404"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_virtual_host_hostnames_are_detected() {
        assert!(is_s3_virtual_host("https://my-bucket.s3.us-east-1.amazonaws.com/tools"));
        assert!(!is_s3_virtual_host("https://dbt.example.com/tools"));
        assert!(!is_s3_virtual_host("not a url"));
    }

    #[test]
    fn listing_html_keeps_only_semver_entries() {
        let html = r#"
            <html><body>
            <a href="1.2.3/">1.2.3/</a>
            <a href="not-a-version/">not-a-version/</a>
            <a href="2.0.0/">2.0.0/</a>
            <a href="../">../</a>
            </body></html>
        "#;
        let versions = parse_listing(html);
        assert_eq!(versions.len(), 2);
        assert!(versions.contains(&"1.2.3".parse().unwrap()));
        assert!(versions.contains(&"2.0.0".parse().unwrap()));
    }

    #[test]
    fn mock_transport_get_round_trips_and_404s_for_unknown_url() {
        let mut bodies = std::collections::HashMap::new();
        bodies.insert("https://repo.example/x".to_string(), b"hello".to_vec());
        let transport = MockTransport::new(bodies);
        assert_eq!(transport.get("https://repo.example/x").unwrap(), b"hello");
        assert!(transport.get("https://repo.example/missing").is_err());
    }
}
