use serde_json::{json, Value};

use crate::bridge::args::require_str;
use crate::bridge::registry::CommandContext;
use crate::error::{CoreError, CoreResult};
use crate::vault::contacts::IdentityBundle;

pub async fn publish_identity(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let keys = ctx.args.get("keys").cloned().unwrap_or(json!({}));
    let bundle = identity.contacts.publish_identity(identity.signer.as_ref(), keys)?;
    serde_json::to_value(bundle).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn get_public_identity(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let bundle = identity
        .contacts
        .published_bundle(&identity.email)?
        .ok_or_else(|| CoreError::NotFound("published identity; run publish_identity".into()))?;
    serde_json::to_value(bundle).map_err(|e| CoreError::Internal(e.to_string()))
}

pub async fn export_identity_bundle(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let bundle = identity
        .contacts
        .published_bundle(&identity.email)?
        .ok_or_else(|| CoreError::NotFound("published identity; run publish_identity".into()))?;
    Ok(json!({
        "bundle": bundle,
        "fingerprint": identity.signer.fingerprint(),
    }))
}

pub async fn import_contact_bundle(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let peer = require_str(&ctx.args, "peer")?;
    let bundle: IdentityBundle = serde_json::from_value(
        ctx.args.get("bundle").cloned().ok_or(CoreError::MissingParam("bundle"))?,
    )
    .map_err(|e| CoreError::ParseParam { param: "bundle", detail: e.to_string() })?;
    let path = identity.contacts.import_bundle(peer, &bundle)?;
    Ok(json!({ "imported": peer, "bundle_path": path }))
}

// --- participants ---

pub async fn list_contacts(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    Ok(json!({ "contacts": identity.contacts.list()? }))
}

/// Trust whatever the peer currently publishes on the sync tree.
pub async fn trust_participant(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let peer = require_str(&ctx.args, "peer")?;
    let path = identity.contacts.trust_published(peer)?;
    Ok(json!({ "trusted": peer, "bundle_path": path }))
}

pub async fn get_participant_bundle(ctx: CommandContext) -> CoreResult<Value> {
    let identity = ctx.core.identity()?;
    let peer = require_str(&ctx.args, "peer")?;
    let bundle = identity
        .contacts
        .published_bundle(peer)?
        .ok_or_else(|| CoreError::NotFound(format!("published bundle for {peer}")))?;
    serde_json::to_value(bundle).map_err(|e| CoreError::Internal(e.to_string()))
}
