use std::path::PathBuf;

use serde_json::{json, Value};

use crate::bridge::args::{opt_str, require_str, require_str_list};
use crate::bridge::registry::CommandContext;
use crate::error::{CoreError, CoreResult};
use crate::sessions::{CreateSessionRequest, DatasetRole};

pub async fn create_session(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let session = identity
        .sessions
        .create(CreateSessionRequest {
            name: require_str(&ctx.args, "name")?.to_string(),
            peer: opt_str(&ctx.args, "peer")?,
            description: opt_str(&ctx.args, "description")?,
            session_id: opt_str(&ctx.args, "session_id")?,
        })
        .await?;
    serde_json::to_value(session).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn list_sessions(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    // Fold in any responses that arrived since the last look.
    identity.sessions.apply_responses()?;
    Ok(json!({ "sessions": identity.sessions.list()? }))
}

pub async fn get_session(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let session = identity.sessions.get(require_str(&ctx.args, "session_id")?)?;
    serde_json::to_value(session).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn close_session(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let session = identity.sessions.close(require_str(&ctx.args, "session_id")?)?;
    serde_json::to_value(session).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn list_session_invitations(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    Ok(json!({ "invitations": identity.sessions.list_invitations()? }))
}

pub async fn accept_session_invitation(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let session = identity
        .sessions
        .accept_invitation(require_str(&ctx.args, "session_id")?)
        .await?;
    serde_json::to_value(session).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn reject_session_invitation(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let session_id = require_str(&ctx.args, "session_id")?;
    identity
        .sessions
        .reject_invitation(session_id, opt_str(&ctx.args, "reason")?)
        .await?;
    Ok(json!({ "rejected": session_id }))
}

// --- linked datasets ---

pub async fn list_session_datasets(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let datasets = identity.sessions.list_datasets(require_str(&ctx.args, "session_id")?)?;
    Ok(json!({ "datasets": datasets }))
}

pub async fn add_dataset_to_session(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let role = match opt_str(&ctx.args, "role")? {
        Some(raw) => DatasetRole::parse(&raw)?,
        None => DatasetRole::Shared,
    };
    let dataset = identity.sessions.add_dataset(
        require_str(&ctx.args, "session_id")?,
        require_str(&ctx.args, "dataset_url")?,
        role,
        opt_str(&ctx.args, "dataset_owner")?,
        opt_str(&ctx.args, "dataset_name")?,
    )?;
    serde_json::to_value(dataset).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn remove_dataset_from_session(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let removed = identity.sessions.remove_dataset(
        require_str(&ctx.args, "session_id")?,
        require_str(&ctx.args, "dataset_url")?,
    )?;
    Ok(json!({ "removed": removed }))
}

pub async fn add_files_to_session(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let session_id = require_str(&ctx.args, "session_id")?;
    let paths: Vec<PathBuf> = require_str_list(&ctx.args, "file_paths")?
        .into_iter()
        .map(PathBuf::from)
        .collect();
    let destinations = identity.sessions.add_files(session_id, &paths)?;
    Ok(json!({ "files": destinations }))
}

pub async fn open_session_folder(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let path = identity.sessions.open_folder(require_str(&ctx.args, "session_id")?)?;
    Ok(json!({ "opened": path }))
}

// --- jupyter ---

pub async fn launch_session_jupyter(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let session = identity.sessions.get(require_str(&ctx.args, "session_id")?)?;

    ctx.sink.progress(0.0, "resolving session");
    ctx.sink.progress(0.3, "launching jupyter");
    let status = ctx
        .core
        .jupyter
        .launch(&session.session_id, &session.session_path)
        .await?;
    ctx.sink.progress(1.0, "");
    serde_json::to_value(status).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn stop_session_jupyter(ctx: CommandContext) -> CoreResult<Value> {
    let session_id = require_str(&ctx.args, "session_id")?;
    let status = ctx.core.jupyter.stop(session_id).await?;
    serde_json::to_value(status).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn reset_session_jupyter(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let session = identity.sessions.get(require_str(&ctx.args, "session_id")?)?;
    let status = ctx
        .core
        .jupyter
        .reset(&session.session_id, &session.session_path)
        .await?;
    serde_json::to_value(status).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn get_session_jupyter_status(ctx: CommandContext) -> CoreResult<Value> {
    let session_id = require_str(&ctx.args, "session_id")?;
    let status = ctx.core.jupyter.status(session_id).await;
    serde_json::to_value(status).map_err(|e| CoreError::Internal(e.to_string()))
}
