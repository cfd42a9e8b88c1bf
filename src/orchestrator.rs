//! Launcher Orchestrator: the top-level state machine sequencing trust
//! refresh, self-upgrade, tool resolution, verification, and process
//! replacement.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::auth::AuthProvider;
use crate::cache::CachePipeline;
use crate::config::{self, ServerConfig};
use crate::error::DbtError;
use crate::repo::RepositoryIndex;
use crate::transport;
use crate::trust::TrustStore;
use crate::upgrade;
use crate::version::Version;
use anyhow::{Context, Result};
use log::{debug, info};
use reqwest::blocking::Client;
use std::env;
use std::path::{Path, PathBuf};

/// Everything parsed out of argv/env before any I/O happens.
pub struct Invocation {
    pub home: PathBuf,
    pub server_name: Option<String>,
    pub offline: bool,
    pub verbose: bool,
    pub version_pin: Option<Version>,
    pub tool: Option<String>,
    pub tool_args: Vec<String>,
}

/// What happened, for `main` to turn into an exit code. A successful
/// `Exec` never actually returns to the caller on unix — it's here for
/// the non-unix emulation path and for tests.
pub enum Outcome {
    HelpPrinted,
    Exec { path: PathBuf, args: Vec<String> },
}

fn current_os() -> &'static str {
    match env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

fn current_arch() -> &'static str {
    match env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn ensure_dirs(home: &Path) -> Result<()> {
    for sub in ["trust", "tools", "conf"] {
        std::fs::create_dir_all(home.join(".dbt").join(sub))
            .with_context(|| format!("creating <home>/.dbt/{sub}"))?;
    }
    Ok(())
}

fn server_config(
    invocation: &Invocation,
) -> Result<(String, ServerConfig)> {
    let multi = config::load(&invocation.home)?;
    let env_server = env::var("DBT_SERVER").ok();
    let (name, server) = config::select_server(
        &multi,
        invocation.server_name.as_deref(),
        env_server.as_deref(),
    )?;
    Ok((name.to_string(), server.clone()))
}

/// Runs the full state machine end to end. Returns `Ok(Outcome::Exec)`
/// when the caller (main.rs) should replace this process image; the
/// `DbtError` carried by a failing `Result` is exactly what should decide
/// the process exit code.
pub fn run(invocation: Invocation) -> Result<Outcome, DbtError> {
    run_inner(invocation).map_err(to_dbt_error)
}

fn to_dbt_error(e: anyhow::Error) -> DbtError {
    match e.downcast::<DbtError>() {
        Ok(dbt) => dbt,
        Err(e) => DbtError::Network {
            url: "(internal)".to_string(),
            detail: format!("{e:#}"),
        },
    }
}

fn run_inner(invocation: Invocation) -> Result<Outcome> {
    debug!("state: Start");
    let Some(tool) = invocation.tool.clone() else {
        return Ok(Outcome::HelpPrinted);
    };

    debug!("state: Ensure-dirs");
    ensure_dirs(&invocation.home)?;

    let (_server_name, server) = server_config(&invocation)?;
    let trust_store = TrustStore::new(&invocation.home);
    let client = Client::new();

    // Resolved once and reused for every transport built below: OIDC
    // variants do a real network exchange (or device-code flow) inside
    // `resolve`, and spec.md §4.3 requires that token to be cached for the
    // life of the process rather than re-obtained per transport.
    let auth = if invocation.offline {
        None
    } else {
        Some(AuthProvider::resolve(&server, &client)?)
    };

    if !invocation.offline {
        debug!("state: Online-branch");
        let bootstrap_transport = transport::backend_for(&server.truststore_url, AuthProvider::None);
        trust_store.refresh(bootstrap_transport.as_ref(), &server).map_err(|e| {
            DbtError::Network {
                url: server.truststore_url.clone(),
                detail: format!("{e:#} (retry with --offline)"),
            }
        })?;

        let transport = transport::backend_for(&server.base_url, auth.clone().expect("resolved above"));
        let launcher_index = RepositoryIndex::for_launcher(transport.as_ref(), &server.base_url);
        let current_exe = env::current_exe().context("resolving current launcher path")?;

        let current = upgrade::is_current(
            &launcher_index,
            transport.as_ref(),
            &current_exe,
            current_os(),
            current_arch(),
        )?;

        if !current {
            info!("self upgrade found new launcher version, installing");
            upgrade::upgrade(
                &launcher_index,
                transport.as_ref(),
                &trust_store.path(),
                &current_exe,
                current_os(),
                current_arch(),
            )?;
            return Ok(Outcome::Exec {
                path: current_exe,
                args: original_argv(),
            });
        }
    }

    debug!("state: Resolve {tool}");
    // Offline mode never exercises this transport (`fetch_offline` reads only
    // from the on-disk cache) so it's built with `AuthProvider::None` rather
    // than running ssh-agent/OIDC credential resolution against the network
    // just to construct a value nothing will call.
    let tools_auth = auth.clone().unwrap_or(AuthProvider::None);
    let transport = transport::backend_for(&server.tools_url, tools_auth);
    let tools_index = RepositoryIndex::for_tools(transport.as_ref(), &server.tools_url);

    debug!("state: Cache & Verify");
    let pipeline = CachePipeline::new(&invocation.home, transport.as_ref(), &trust_store.path());
    let path = if invocation.offline {
        pipeline.fetch_offline(&tool, invocation.version_pin.as_ref())?
    } else {
        pipeline.fetch_online(
            &tools_index,
            &tool,
            invocation.version_pin.as_ref(),
            current_os(),
            current_arch(),
        )?
    };

    info!("exec'ing {tool}");
    Ok(Outcome::Exec {
        path,
        args: invocation.tool_args,
    })
}

fn original_argv() -> Vec<String> {
    env::args().skip(1).collect()
}

/// Replaces the current process image with `path`, passing `args` as the
/// new `argv[1..]` and the current environment unchanged. On unix this
/// never returns on success; elsewhere it spawns a child, waits, and
/// exits with the child's status.
#[cfg(unix)]
pub fn replace_process(path: &Path, args: &[String]) -> Result<DbtError> {
    use std::ffi::CString;

    let path_c = CString::new(path.as_os_str().to_string_lossy().as_bytes())
        .context("path contains a NUL byte")?;
    let mut argv: Vec<CString> = vec![path_c.clone()];
    for arg in args {
        argv.push(CString::new(arg.as_bytes()).context("argument contains a NUL byte")?);
    }

    let err = nix::unistd::execv(&path_c, &argv).unwrap_err();
    Ok(DbtError::Exec {
        path: path.display().to_string(),
        detail: err.to_string(),
    })
}

#[cfg(not(unix))]
pub fn replace_process(path: &Path, args: &[String]) -> Result<DbtError> {
    let status = std::process::Command::new(path)
        .args(args)
        .status()
        .map_err(|e| DbtError::Exec {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
    std::process::exit(status.code().unwrap_or(1));
}
