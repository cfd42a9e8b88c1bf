//! Auth Provider: a tagged variant over the five credential shapes a server
//! entry can configure, with a single `decorate` operation at the seam
//! where a request actually goes out over the wire.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

pub mod oidc;
pub mod ssh_jwt;

use crate::config::ServerConfig;
use crate::error::DbtError;
use anyhow::Result;
use reqwest::blocking::{Client, RequestBuilder};

/// One entry per credential shape `ServerConfig::credentials`/`oidc` can
/// describe. Built once per invocation from the active server's config and
/// reused for every outgoing request, rather than re-derived per call —
/// `Clone` exists so the orchestrator can share a single `resolve()` (and
/// therefore a single OIDC exchange/device-code run) across the launcher-
/// upgrade transport and the tools transport instead of resolving twice.
#[derive(Clone)]
pub enum AuthProvider {
    None,
    Basic { username: String, password: String },
    StaticBearer { token: String },
    SshAgentJwt { jwt: String },
    Oidc { id_token: String },
}

/// Tags any failure arising while resolving or exercising a credential
/// shape as `DbtError::Auth`, so it surfaces through `to_dbt_error` as an
/// auth failure rather than falling through to the generic network
/// classification (credential shell commands, ssh-agent signing, and the
/// OIDC HTTP exchanges all fail for reasons unrelated to --offline).
fn auth_err<E: std::fmt::Display>(context: &str) -> impl Fn(E) -> anyhow::Error + '_ {
    move |e| DbtError::Auth(format!("{context}: {e:#}")).into()
}

impl AuthProvider {
    /// Resolves the configured credential shape for `server` into a live
    /// provider. SSH-agent and OIDC variants do their network/agent work
    /// here, once, so that `decorate` itself never fails or blocks.
    pub fn resolve(server: &ServerConfig, client: &Client) -> Result<Self> {
        let creds = &server.credentials;

        if let Some(token) = &creds.static_bearer_token {
            return Ok(AuthProvider::StaticBearer {
                token: token.clone(),
            });
        }

        if !creds.public_key.is_absent() {
            let username = creds
                .username
                .resolve()
                .map_err(auth_err("resolving username credential"))?
                .ok_or_else(|| DbtError::Auth("public_key credential configured without a username".into()))?;
            let public_key = creds
                .public_key
                .resolve()
                .map_err(auth_err("resolving public_key credential"))?
                .ok_or_else(|| DbtError::Auth("public_key credential source resolved to nothing".into()))?;

            if let Some(oidc) = &server.oidc {
                let jwt = ssh_jwt::sign_jwt(&username, &oidc.audience, &public_key)
                    .map_err(auth_err("signing SSH-agent JWT"))?;
                let id_token = oidc::exchange_ssh_jwt(client, oidc, &jwt)
                    .map_err(auth_err("exchanging SSH JWT for an OIDC id token"))?;
                return Ok(AuthProvider::Oidc { id_token });
            }

            let jwt = ssh_jwt::sign_jwt(&username, &server.base_url, &public_key)
                .map_err(auth_err("signing SSH-agent JWT"))?;
            return Ok(AuthProvider::SshAgentJwt { jwt });
        }

        if let Some(oidc) = &server.oidc {
            let id_token = oidc::device_code_flow(client, oidc)
                .map_err(auth_err("running OIDC device-code flow"))?;
            return Ok(AuthProvider::Oidc { id_token });
        }

        if !creds.username.is_absent() || !creds.password.is_absent() {
            let username = creds
                .username
                .resolve()
                .map_err(auth_err("resolving username credential"))?
                .unwrap_or_default();
            let password = creds
                .password
                .resolve()
                .map_err(auth_err("resolving password credential"))?
                .unwrap_or_default();
            return Ok(AuthProvider::Basic { username, password });
        }

        Ok(AuthProvider::None)
    }

    /// Attaches the resolved credential to an outgoing request builder.
    pub fn decorate(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            AuthProvider::None => request,
            AuthProvider::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            AuthProvider::StaticBearer { token } => request.bearer_auth(token),
            // Plain SSH-agent JWT auth (no OIDC exchange) uses a bare
            // `Token:` header per the reposerver's own auth contract, not
            // `Authorization: Bearer` — that form is reserved for the OIDC
            // variants below, whose id tokens the reposerver validates
            // against its OIDC connector instead.
            AuthProvider::SshAgentJwt { jwt } => request.header("Token", jwt),
            AuthProvider::Oidc { id_token } => request.bearer_auth(id_token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    fn server_with(credentials: Credentials) -> ServerConfig {
        ServerConfig {
            base_url: "https://repo.example/dbt".into(),
            truststore_url: "https://repo.example/truststore".into(),
            tools_url: "https://repo.example/tools".into(),
            credentials,
            oidc: None,
        }
    }

    #[test]
    fn absent_credentials_resolve_to_none() {
        let client = Client::new();
        let server = server_with(Credentials::default());
        let provider = AuthProvider::resolve(&server, &client).unwrap();
        assert!(matches!(provider, AuthProvider::None));
    }

    #[test]
    fn failing_shell_credential_surfaces_as_auth_error_not_network() {
        let client = Client::new();
        let mut creds = Credentials::default();
        creds.username.shell = Some("exit 1".to_string());
        creds.password.value = Some("irrelevant".to_string());
        let server = server_with(creds);
        let err = AuthProvider::resolve(&server, &client).unwrap_err();
        assert!(err.downcast_ref::<DbtError>().is_some_and(|e| matches!(e, DbtError::Auth(_))));
    }

    #[test]
    fn static_bearer_token_takes_priority() {
        let client = Client::new();
        let mut creds = Credentials::default();
        creds.static_bearer_token = Some("s3cr3t".to_string());
        let server = server_with(creds);
        let provider = AuthProvider::resolve(&server, &client).unwrap();
        assert!(matches!(provider, AuthProvider::StaticBearer { token } if token == "s3cr3t"));
    }

    #[test]
    fn ssh_jwt_decorates_with_token_header_not_bearer() {
        let client = Client::new();
        let provider = AuthProvider::SshAgentJwt {
            jwt: "eyJhbGciOiJFUzI1NiJ9.payload.sig".to_string(),
        };
        let request = provider.decorate(client.get("https://repo.example/x"));
        let built = request.build().unwrap();
        assert_eq!(
            built.headers().get("Token").unwrap(),
            "eyJhbGciOiJFUzI1NiJ9.payload.sig"
        );
        assert!(built.headers().get("Authorization").is_none());
    }

    #[test]
    fn basic_credentials_resolve_when_username_or_password_set() {
        let client = Client::new();
        let mut creds = Credentials::default();
        creds.username.value = Some("alice".to_string());
        creds.password.value = Some("hunter2".to_string());
        let server = server_with(creds);
        let provider = AuthProvider::resolve(&server, &client).unwrap();
        assert!(matches!(provider, AuthProvider::Basic { username, password }
            if username == "alice" && password == "hunter2"));
    }
}
