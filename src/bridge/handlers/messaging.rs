use serde_json::{json, Value};

use crate::bridge::args::{opt_object, opt_str, require_str, require_str_list};
use crate::bridge::registry::CommandContext;
use crate::error::{CoreError, CoreResult};
use crate::vault::messages::SendMessageRequest;
use crate::vault::spaces;
use crate::vault::threads::ThreadScope;

pub async fn send_message(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    // `to` and `recipients` are interchangeable on the wire.
    let to = require_str_list(&ctx.args, "to")
        .or_else(|_| require_str_list(&ctx.args, "recipients"))?;
    let body = require_str(&ctx.args, "body")?.to_string();

    let message = identity
        .messages
        .send(SendMessageRequest {
            to,
            subject: opt_str(&ctx.args, "subject")?,
            body,
            reply_to: opt_str(&ctx.args, "reply_to")?,
            metadata: opt_object(&ctx.args, "metadata")?.unwrap_or_default(),
            id: None,
        })
        .await?;
    serde_json::to_value(message).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn list_message_threads(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let scope = ThreadScope::parse(&opt_str(&ctx.args, "scope")?.unwrap_or_default());
    let threads = identity.messages.list_threads(&scope)?;
    Ok(json!({ "threads": threads }))
}

pub async fn get_thread_messages(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let thread_id = require_str(&ctx.args, "thread_id")?;
    let messages = identity.messages.thread_messages(thread_id)?;
    Ok(json!({ "thread_id": thread_id, "messages": messages }))
}

/// Kick a sync, drain the delivery queue, fold session responses, and
/// return the fresh thread list in one round trip.
pub async fn refresh_messages_batched(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    // Sync trigger is best-effort: a stopped daemon doesn't block a
    // local-only refresh.
    if let Err(e) = ctx.core.syftbox.trigger_sync().await {
        tracing::debug!(error = %e, "refresh without sync trigger");
    }

    let report = identity.messages.deliver_incoming().await?;
    identity.sessions.apply_responses()?;

    let scope = ThreadScope::parse(&opt_str(&ctx.args, "scope")?.unwrap_or_default());
    let threads = identity.messages.list_threads(&scope)?;
    Ok(json!({
        "threads": threads,
        "new_messages": report.new_messages.len(),
    }))
}

pub async fn sync_messages_with_failures(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let synced = ctx.core.syftbox.trigger_sync().await.is_ok();
    let report = identity.messages.deliver_incoming().await?;
    Ok(json!({
        "new_messages": report.new_messages.len(),
        "synced": synced,
        "new_failed": report.new_failed,
    }))
}

pub async fn mark_thread_as_read(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let thread_id = require_str(&ctx.args, "thread_id")?;
    let marked = identity.messages.mark_thread_read(thread_id)?;
    Ok(json!({ "thread_id": thread_id, "marked": marked }))
}

pub async fn delete_message(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let message_id = require_str(&ctx.args, "message_id")?;
    let deleted = identity.messages.delete_message(message_id).await?;
    Ok(json!({ "deleted": deleted }))
}

pub async fn delete_thread(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let thread_id = require_str(&ctx.args, "thread_id")?;
    let deleted = identity.messages.delete_thread(thread_id).await?;
    Ok(json!({ "deleted": deleted }))
}

// --- spaces ---

pub async fn list_spaces(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let spaces = spaces::list_spaces(&identity.messages)?;
    Ok(json!({ "spaces": spaces }))
}

pub async fn create_space(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let participants = require_str_list(&ctx.args, "participants")?;
    let name = opt_str(&ctx.args, "name")?;
    let space = spaces::create_space(&identity.messages, &participants, name).await?;
    serde_json::to_value(space).map_err(|e| CoreError::Internal(e.to_string()))
}
