//! OIDC token acquisition: RFC-8693 token exchange of an SSH-signed JWT,
//! and the OAuth2 device-authorization flow.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::OidcConfig;
use anyhow::{anyhow, Context, Result};
use log::info;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::thread::sleep;
use std::time::{Duration, Instant};

#[derive(Debug, Deserialize, Clone)]
struct Discovery {
    token_endpoint: String,
    #[serde(default)]
    device_authorization_endpoint: Option<String>,
}

fn discover(client: &Client, issuer_url: &str) -> Result<Discovery> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer_url.trim_end_matches('/')
    );
    let resp = client
        .get(&url)
        .send()
        .with_context(|| format!("fetching OIDC discovery document from {url}"))?;
    if !resp.status().is_success() {
        return Err(anyhow!(
            "OIDC discovery at {url} returned status {}",
            resp.status()
        ));
    }
    resp.json::<Discovery>()
        .with_context(|| format!("parsing OIDC discovery document from {url}"))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// RFC-8693 exchange of an SSH-signed JWT (`subject_token`) for an OIDC id
/// token, with `connector_id=ssh` as the form parameter the spec's
/// SSH-OIDC variant requires.
pub fn exchange_ssh_jwt(client: &Client, config: &OidcConfig, subject_jwt: &str) -> Result<String> {
    let discovery = discover(client, &config.issuer_url)?;

    let mut form = vec![
        ("grant_type", "urn:ietf:params:oauth:grant-type:token-exchange".to_string()),
        ("subject_token", subject_jwt.to_string()),
        ("subject_token_type", "access_token".to_string()),
        ("requested_token_type", "id_token".to_string()),
        ("client_id", config.client_id.clone()),
        ("audience", config.audience.clone()),
        ("connector_id", "ssh".to_string()),
    ];
    if let Some(secret) = &config.client_secret {
        form.push(("client_secret", secret.clone()));
    }

    let resp = client
        .post(&discovery.token_endpoint)
        .form(&form)
        .send()
        .context("submitting RFC-8693 token exchange request")?;

    let status = resp.status();
    let body: TokenResponse = resp
        .json()
        .context("parsing token-exchange response body")?;

    if let Some(err) = body.error {
        return Err(anyhow!("OIDC token exchange rejected: {err} (status {status})"));
    }
    body.id_token
        .ok_or_else(|| anyhow!("OIDC token exchange response missing id_token (status {status})"))
}

#[derive(Debug, Deserialize)]
struct DeviceAuthResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    expires_in: u64,
    #[serde(default = "default_poll_interval")]
    interval: u64,
}

fn default_poll_interval() -> u64 {
    5
}

/// OAuth2 device-authorization flow: discover the endpoints, start the
/// flow, show the user the verification URI/code, then poll the token
/// endpoint until success, expiry, or a fatal error. `authorization_pending`
/// keeps the current interval; `slow_down` doubles it, matching the spec's
/// backoff rule.
pub fn device_code_flow(client: &Client, config: &OidcConfig) -> Result<String> {
    let discovery = discover(client, &config.issuer_url)?;
    let device_auth_endpoint = discovery
        .device_authorization_endpoint
        .ok_or_else(|| anyhow!("issuer {} has no device_authorization_endpoint", config.issuer_url))?;

    let resp = client
        .post(&device_auth_endpoint)
        .form(&[
            ("client_id", config.client_id.as_str()),
            ("audience", config.audience.as_str()),
        ])
        .send()
        .context("starting device authorization flow")?;
    if !resp.status().is_success() {
        return Err(anyhow!(
            "device authorization request failed with status {}",
            resp.status()
        ));
    }
    let device: DeviceAuthResponse = resp.json().context("parsing device authorization response")?;

    if let Some(complete) = &device.verification_uri_complete {
        info!("To authenticate, visit: {complete}");
    } else {
        info!(
            "To authenticate, visit {} and enter code {}",
            device.verification_uri, device.user_code
        );
    }

    let deadline = Instant::now() + Duration::from_secs(device.expires_in);
    let mut interval = Duration::from_secs(device.interval.max(1));

    loop {
        if Instant::now() >= deadline {
            return Err(anyhow!("device code expired before authorization completed"));
        }
        sleep(interval);

        let resp = client
            .post(&discovery.token_endpoint)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("device_code", device.device_code.as_str()),
                ("client_id", config.client_id.as_str()),
            ])
            .send()
            .context("polling device code token endpoint")?;

        let body: TokenResponse = resp.json().context("parsing device code poll response")?;

        match body.error.as_deref() {
            None => {
                return body
                    .id_token
                    .ok_or_else(|| anyhow!("token endpoint succeeded but returned no id_token"));
            }
            Some("authorization_pending") => continue,
            Some("slow_down") => {
                interval *= 2;
            }
            Some(other) => return Err(anyhow!("device code flow failed: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_poll_interval_is_five_seconds() {
        assert_eq!(default_poll_interval(), 5);
    }
}
