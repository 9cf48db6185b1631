use std::path::PathBuf;

use serde_json::{json, Value};

use crate::bridge::args::{opt_object, opt_str, require_str};
use crate::bridge::registry::CommandContext;
use crate::error::{CoreError, CoreResult};
use crate::settings::Settings;
use crate::supervisor::ControlMsg;

pub async fn get_settings(ctx: CommandContext) -> CoreResult<Value> {
    serde_json::to_value(ctx.core.settings.load()).map_err(|e| CoreError::Internal(e.to_string()))
}

/// Merge a patch of recognized settings keys. The patch rides either in
/// `settings` or directly as the args object.
pub async fn update_settings(ctx: CommandContext) -> CoreResult<Value> {
    let patch = match opt_object(&ctx.args, "settings")? {
        Some(patch) => patch,
        None => ctx.args.clone(),
    };
    if patch.is_empty() {
        return Err(CoreError::MissingParam("settings"));
    }
    let merged = ctx.core.settings.load().apply_patch(&patch)?;
    ctx.core.settings.save(&merged)?;
    serde_json::to_value(&merged).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn get_setting(ctx: CommandContext) -> CoreResult<Value> {
    let key = require_str(&ctx.args, "key")?;
    if !Settings::is_recognized_key(key) {
        return Err(CoreError::NotFound(format!("setting {key}")));
    }
    let value = serde_json::to_value(ctx.core.settings.load())
        .map_err(|e| CoreError::Internal(e.to_string()))?;
    Ok(json!({ "key": key, "value": value.get(key).cloned().unwrap_or(Value::Null) }))
}

pub async fn set_setting(ctx: CommandContext) -> CoreResult<Value> {
    let key = require_str(&ctx.args, "key")?.to_string();
    let value = ctx.args.get("value").cloned().ok_or(CoreError::MissingParam("value"))?;
    let mut patch = serde_json::Map::new();
    patch.insert(key.clone(), value);
    let merged = ctx.core.settings.load().apply_patch(&patch)?;
    ctx.core.settings.save(&merged)?;
    Ok(json!({ "key": key, "saved": true }))
}

// --- profiles ---

pub async fn list_profiles(ctx: CommandContext) -> CoreResult<Value> {
    let active = ctx.core.profiles.active().map(|p| p.id);
    Ok(json!({ "profiles": ctx.core.profiles.list(), "active": active }))
}

pub async fn get_active_profile(ctx: CommandContext) -> CoreResult<Value> {
    match ctx.core.profiles.active() {
        Some(profile) => serde_json::to_value(profile).map_err(|e| CoreError::Internal(e.to_string())),
        None => Err(CoreError::NotFound("active profile".into())),
    }
}

pub async fn create_profile(ctx: CommandContext) -> CoreResult<Value> {
    let email = require_str(&ctx.args, "email")?.to_string();
    let home = match opt_str(&ctx.args, "home")? {
        Some(path) => PathBuf::from(path),
        None => ctx.core.config_root.join(email.replace('@', "_at_")),
    };
    let profile = ctx.core.profiles.create(&email, &home)?;
    serde_json::to_value(profile).map_err(|e| CoreError::Internal(e.to_string()))
}

/// Validate the target, then hand the actual switch to the supervisor:
/// it tears down the bridge and the sync daemon, swaps the active
/// profile, and boots the next epoch.
pub async fn switch_profile(ctx: CommandContext) -> CoreResult<Value> {
    let profile_id = require_str(&ctx.args, "profile_id")?.to_string();
    if ctx.core.profiles.get(&profile_id).is_none() {
        return Err(CoreError::NotFound(format!("profile {profile_id}")));
    }
    ctx.control.send(ControlMsg::SwitchProfile(profile_id.clone()));
    Ok(json!({ "switching": true, "profile_id": profile_id }))
}

pub async fn delete_profile(ctx: CommandContext) -> CoreResult<Value> {
    let profile_id = require_str(&ctx.args, "profile_id")?;
    let removed = ctx.core.profiles.delete(profile_id)?;
    Ok(json!({ "deleted": removed.id, "email": removed.email }))
}
