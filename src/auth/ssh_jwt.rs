//! SSH-agent-signed JWT construction, used both directly (the SSH-agent
//! JWT auth variant) and as the subject token for the SSH-OIDC token
//! exchange variant.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Grounded on the teacher's `deploy/src-tauri/src/provision_server/ssh.rs`,
//! which already connects to a remote host and works with agent-held
//! identities. libssh2 (the `ssh2` crate the teacher uses there) only
//! exposes the agent for authentication handshakes, not for signing
//! arbitrary bytes, so this talks the ssh-agent wire protocol directly via
//! `ssh-agent-client-rs` instead: no private key material ever leaves the
//! process holding it.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::json;
use ssh_agent_client_rs::Client;
use ssh_key::PublicKey;
use std::env;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Connects to the SSH agent listening on `SSH_AUTH_SOCK`, finds the
/// identity whose public key matches `public_key_armored`, and returns a
/// compact JWT (`header.payload.signature`, all base64url-no-pad) over
/// `{sub, aud, iat}` signed by that identity.
pub fn sign_jwt(username: &str, audience: &str, public_key_armored: &str) -> Result<String> {
    let sock = env::var("SSH_AUTH_SOCK")
        .context("SSH_AUTH_SOCK is not set; no ssh-agent to sign with")?;
    let mut client =
        Client::connect(Path::new(&sock)).context("connecting to ssh-agent at SSH_AUTH_SOCK")?;

    let wanted = PublicKey::from_openssh(public_key_armored.trim())
        .context("parsing configured public_key as an OpenSSH public key")?;

    let identities = client
        .list_identities()
        .context("listing ssh-agent identities")?;
    let identity = identities
        .into_iter()
        .find(|key| *key == wanted)
        .ok_or_else(|| anyhow!("no identity in ssh-agent matches the configured public key"))?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let header = json!({"alg": "SSH-AGENT", "typ": "JWT"});
    let claims = json!({"sub": username, "aud": audience, "iat": now});

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    );

    let signature = client
        .sign(&identity, signing_input.as_bytes())
        .context("requesting signature from ssh-agent")?;

    Ok(format!(
        "{signing_input}.{}",
        URL_SAFE_NO_PAD.encode(signature.as_bytes())
    ))
}
