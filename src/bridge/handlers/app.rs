use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};

use crate::bridge::args::{opt_object, opt_str, opt_usize, require_str};
use crate::bridge::registry::CommandContext;
use crate::error::{CoreError, CoreResult};
use crate::supervisor::ControlMsg;

pub async fn get_app_version(_ctx: CommandContext) -> CoreResult<Value> {
    Ok(json!(env!("CARGO_PKG_VERSION")))
}

pub async fn get_app_status(ctx: CommandContext) -> CoreResult<Value> {
    let params = ctx.core.bridge_params();
    let syftbox = ctx.core.syftbox.status().await;
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "email": ctx.core.identity().ok().map(|v| v.email.clone()),
        "home": ctx.core.home,
        "uptime_secs": ctx.core.started_at.elapsed().as_secs(),
        "bridge": {
            "ws_port": params.ws_port,
            "http_port": params.http_port,
            "token_required": params.token.is_some(),
        },
        "syftbox": syftbox,
        "syftbox_version_override": ctx.core.env.syftbox_version,
    }))
}

pub async fn get_system_info(_ctx: CommandContext) -> CoreResult<Value> {
    Ok(json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "pid": std::process::id(),
    }))
}

// --- onboarding ---

pub async fn get_onboarding_status(ctx: CommandContext) -> CoreResult<Value> {
    let has_identity = ctx.core.has_identity();
    let published = ctx
        .core
        .identity()
        .ok()
        .map(|v| {
            v.contacts
                .published_bundle(&v.email)
                .ok()
                .flatten()
                .is_some()
        })
        .unwrap_or(false);
    Ok(json!({
        "has_profile": !ctx.core.profiles.list().is_empty(),
        "has_identity": has_identity,
        "identity_published": published,
        "syftbox_authenticated": ctx.core.syftbox.config_info().is_authenticated,
    }))
}

/// Create the first profile and restart services so the vault stores bind
/// to the new identity.
pub async fn complete_onboarding(ctx: CommandContext) -> CoreResult<Value> {
    let email = require_str(&ctx.args, "email")?.to_string();
    let home = match opt_str(&ctx.args, "home")? {
        Some(path) => PathBuf::from(path),
        None => ctx.core.config_root.join(email.replace('@', "_at_")),
    };
    let profile = ctx.core.profiles.create(&email, &home)?;
    ctx.control.send(ControlMsg::RestartServices);
    Ok(json!({ "profile": profile, "restarting": true }))
}

// --- ui_control ---

/// Reveal a path in the OS file manager. Only paths under the profile
/// home are allowed out.
pub async fn open_path(ctx: CommandContext) -> CoreResult<Value> {
    let raw = require_str(&ctx.args, "path")?;
    let path = super::jail::resolve_in_home(&ctx.core.home, raw)?;
    if !path.exists() {
        return Err(CoreError::NotFound(format!("path {raw}")));
    }

    let opener = if cfg!(target_os = "macos") { "open" } else { "xdg-open" };
    let _ = std::process::Command::new(opener)
        .arg(&path)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    Ok(json!({ "opened": path }))
}

// --- dependencies ---

const KNOWN_DEPENDENCIES: [&str; 5] = ["docker", "nextflow", "java", "jupyter", "syftbox"];

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(name);
        candidate.is_file().then_some(candidate)
    })
}

pub async fn check_dependencies(_ctx: CommandContext) -> CoreResult<Value> {
    let deps: Vec<Value> = KNOWN_DEPENDENCIES
        .iter()
        .map(|name| {
            let path = find_in_path(name);
            json!({ "name": name, "found": path.is_some(), "path": path })
        })
        .collect();
    Ok(json!({ "dependencies": deps }))
}

/// Resolve a dependency, streaming progress along the way. Actual
/// package installation belongs to the OS installers; this verifies the
/// binary and reports where it landed.
pub async fn install_dependency(ctx: CommandContext) -> CoreResult<Value> {
    let name = require_str(&ctx.args, "name")?.to_string();
    if !KNOWN_DEPENDENCIES.contains(&name.as_str()) {
        return Err(CoreError::ParseParam {
            param: "name",
            detail: format!("unknown dependency {name:?}"),
        });
    }

    ctx.sink.progress(0.0, format!("checking {name}"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    if ctx.sink.is_cancelled() {
        return Err(CoreError::Cancelled);
    }

    let path = find_in_path(&name);
    ctx.sink.progress(0.5, format!("verifying {name}"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    if ctx.sink.is_cancelled() {
        return Err(CoreError::Cancelled);
    }

    ctx.sink.progress(1.0, "");
    Ok(json!({ "installed": path.is_some(), "path": path }))
}

// --- network ---

pub async fn check_network_status(ctx: CommandContext) -> CoreResult<Value> {
    let server_url = ctx
        .core
        .syftbox
        .config()
        .server_url
        .clone()
        .unwrap_or_else(|| "https://syftbox.net".to_string());
    let reachable = ctx
        .core
        .http
        .get(&server_url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .is_ok();
    Ok(json!({ "server_url": server_url, "reachable": reachable }))
}

// --- logs ---

pub async fn get_audit_log(ctx: CommandContext) -> CoreResult<Value> {
    let max_entries = opt_usize(&ctx.args, "max_entries")?.unwrap_or(100);
    let entries = ctx.core.audit.tail(max_entries)?;
    Ok(json!({ "entries": entries }))
}

pub async fn clear_audit_log(ctx: CommandContext) -> CoreResult<Value> {
    ctx.core.audit.clear().await?;
    Ok(json!({ "cleared": true }))
}

pub async fn get_desktop_log(ctx: CommandContext) -> CoreResult<Value> {
    let max_lines = opt_usize(&ctx.args, "max_lines")?.unwrap_or(200);
    let path = ctx.core.home.join("logs").join("desktop.log");
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    Ok(json!({ "lines": lines[start..].to_vec(), "path": path }))
}

// --- ai passthrough ---

/// The desktop's AI panel talks to whatever endpoint is configured in
/// settings; the core only proxies the configured coordinates.
pub async fn get_ai_config(ctx: CommandContext) -> CoreResult<Value> {
    let settings = ctx.core.settings.load();
    Ok(json!({
        "api_url": settings.ai_api_url,
        "model": settings.ai_model,
        "token_configured": settings.ai_api_token.is_some(),
    }))
}

pub async fn update_ai_config(ctx: CommandContext) -> CoreResult<Value> {
    let mut patch = serde_json::Map::new();
    for (from, to) in [("api_url", "ai_api_url"), ("api_token", "ai_api_token"), ("model", "ai_model")] {
        if let Some(value) = ctx.args.get(from) {
            patch.insert(to.to_string(), value.clone());
        }
    }
    if let Some(extra) = opt_object(&ctx.args, "settings")? {
        patch.extend(extra);
    }
    let merged = ctx.core.settings.load().apply_patch(&patch)?;
    ctx.core.settings.save(&merged)?;
    Ok(json!({ "updated": true }))
}
