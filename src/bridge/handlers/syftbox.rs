use serde_json::{json, Value};

use crate::bridge::args::require_str;
use crate::bridge::registry::CommandContext;
use crate::error::{CoreError, CoreResult};

pub async fn start_syftbox_client(ctx: CommandContext) -> CoreResult<Value> {
    ctx.core.syftbox.start().await?;
    serde_json::to_value(ctx.core.syftbox.status().await).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn stop_syftbox_client(ctx: CommandContext) -> CoreResult<Value> {
    ctx.core.syftbox.stop().await?;
    serde_json::to_value(ctx.core.syftbox.status().await).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn restart_syftbox_client(ctx: CommandContext) -> CoreResult<Value> {
    ctx.core.syftbox.restart().await?;
    serde_json::to_value(ctx.core.syftbox.status().await).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn get_syftbox_state(ctx: CommandContext) -> CoreResult<Value> {
    serde_json::to_value(ctx.core.syftbox.status().await).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn trigger_syftbox_sync(ctx: CommandContext) -> CoreResult<Value> {
    ctx.core.syftbox.trigger_sync().await?;
    Ok(json!({ "triggered": true }))
}

pub async fn syftbox_queue_status(ctx: CommandContext) -> CoreResult<Value> {
    ctx.core.syftbox.queue_status().await
}

pub async fn get_syftbox_config_info(ctx: CommandContext) -> CoreResult<Value> {
    serde_json::to_value(ctx.core.syftbox.config_info()).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn syftbox_request_otp(ctx: CommandContext) -> CoreResult<Value> {
    let email = require_str(&ctx.args, "email")?;
    ctx.core.syftbox.request_otp(email).await
}

pub async fn syftbox_submit_otp(ctx: CommandContext) -> CoreResult<Value> {
    let email = require_str(&ctx.args, "email")?;
    let code = require_str(&ctx.args, "code")?;
    ctx.core.syftbox.submit_otp(email, code).await
}
