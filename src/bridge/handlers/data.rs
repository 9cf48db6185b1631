use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::bridge::args::{opt_str, require_str};
use crate::bridge::registry::CommandContext;
use crate::error::{CoreError, CoreResult};

use super::jail::resolve_in_home;

// --- files ---

pub async fn list_directory(ctx: CommandContext) -> CoreResult<Value> {
    let raw = opt_str(&ctx.args, "path")?.unwrap_or_else(|| ".".into());
    let dir = resolve_in_home(&ctx.core.home, &raw)?;
    if !dir.is_dir() {
        return Err(CoreError::NotFound(format!("directory {raw}")));
    }

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "is_dir": metadata.is_dir(),
            "size": metadata.is_file().then(|| metadata.len()),
        }));
    }
    entries.sort_by(|a, b| {
        a["name"].as_str().unwrap_or_default().cmp(b["name"].as_str().unwrap_or_default())
    });
    Ok(json!({ "path": dir, "entries": entries }))
}

pub async fn get_file_info(ctx: CommandContext) -> CoreResult<Value> {
    let raw = require_str(&ctx.args, "path")?;
    let path = resolve_in_home(&ctx.core.home, raw)?;
    if !path.exists() {
        return Err(CoreError::NotFound(format!("path {raw}")));
    }
    let metadata = std::fs::metadata(&path)?;
    let modified: Option<DateTime<Utc>> = metadata.modified().ok().map(Into::into);
    Ok(json!({
        "path": path,
        "is_dir": metadata.is_dir(),
        "size": metadata.len(),
        "modified": modified,
    }))
}

// --- projects ---

pub async fn list_projects(ctx: CommandContext) -> CoreResult<Value> {
    let root = ctx.core.home.join("projects");
    let mut projects = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&root) {
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let manifest = entry.path().join("project.json");
            let details: Value = std::fs::read_to_string(&manifest)
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or(Value::Null);
            projects.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "path": entry.path(),
                "manifest": details,
            }));
        }
    }
    Ok(json!({ "projects": projects }))
}

pub async fn create_project(ctx: CommandContext) -> CoreResult<Value> {
    let name = require_str(&ctx.args, "name")?;
    if name.contains('/') || name.starts_with('.') {
        return Err(CoreError::ParseParam {
            param: "name",
            detail: format!("not a valid project name: {name:?}"),
        });
    }
    let dir = ctx.core.home.join("projects").join(name);
    if dir.exists() {
        return Err(CoreError::PreconditionFailed(format!("project {name} already exists")));
    }
    std::fs::create_dir_all(&dir)?;
    let manifest = json!({ "name": name, "created_at": Utc::now() });
    crate::vault::write_json_atomic(&dir.join("project.json"), &manifest)?;
    Ok(json!({ "name": name, "path": dir }))
}

// --- pipelines ---

pub async fn list_pipelines(ctx: CommandContext) -> CoreResult<Value> {
    let root = ctx.core.home.join("pipelines");
    let mut pipelines = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Ok(raw) = std::fs::read_to_string(&path) {
                    if let Ok(pipeline) = serde_json::from_str::<Value>(&raw) {
                        pipelines.push(pipeline);
                    }
                }
            }
        }
    }
    Ok(json!({ "pipelines": pipelines }))
}

// --- datasets (published on the sync tree) ---

pub async fn list_datasets(ctx: CommandContext) -> CoreResult<Value> {
    let datasites = ctx.core.data_dir.join("datasites");
    let mut datasets = Vec::new();
    if let Ok(sites) = std::fs::read_dir(&datasites) {
        for site in sites.flatten() {
            let owner = site.file_name().to_string_lossy().to_string();
            let public = site.path().join("public").join("datasets");
            let Ok(entries) = std::fs::read_dir(&public) else {
                continue;
            };
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    let name = entry.file_name().to_string_lossy().to_string();
                    datasets.push(json!({
                        "owner": owner,
                        "name": name,
                        "url": format!("syft://{owner}/public/datasets/{name}"),
                    }));
                }
            }
        }
    }
    Ok(json!({ "datasets": datasets }))
}

pub async fn get_dataset(ctx: CommandContext) -> CoreResult<Value> {
    let owner = require_str(&ctx.args, "owner")?;
    let name = require_str(&ctx.args, "name")?;
    let dir = ctx
        .core
        .data_dir
        .join("datasites")
        .join(owner)
        .join("public")
        .join("datasets")
        .join(name);
    if !dir.is_dir() {
        return Err(CoreError::NotFound(format!("dataset {owner}/{name}")));
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        files.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "size": metadata.len(),
            "is_dir": metadata.is_dir(),
        }));
    }
    Ok(json!({
        "owner": owner,
        "name": name,
        "url": format!("syft://{owner}/public/datasets/{name}"),
        "files": files,
    }))
}

// --- runs ---

pub async fn list_runs(ctx: CommandContext) -> CoreResult<Value> {
    let root = ctx.core.home.join("runs");
    let mut runs = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Ok(raw) = std::fs::read_to_string(&path) {
                    if let Ok(run) = serde_json::from_str::<Value>(&raw) {
                        runs.push(run);
                    }
                }
            }
        }
    }
    Ok(json!({ "runs": runs }))
}

// --- sql ---

fn sql_connection(home: &Path) -> CoreResult<rusqlite::Connection> {
    rusqlite::Connection::open(home.join("desktop.db"))
        .map_err(|e| CoreError::Internal(format!("sqlite open: {e}")))
}

fn row_value(row: &rusqlite::Row<'_>, idx: usize) -> Value {
    use rusqlite::types::ValueRef;
    match row.get_ref(idx) {
        Ok(ValueRef::Null) => Value::Null,
        Ok(ValueRef::Integer(i)) => json!(i),
        Ok(ValueRef::Real(f)) => json!(f),
        Ok(ValueRef::Text(t)) => json!(String::from_utf8_lossy(t)),
        Ok(ValueRef::Blob(b)) => json!(format!("<{} bytes>", b.len())),
        Err(_) => Value::Null,
    }
}

pub async fn sql_query(ctx: CommandContext) -> CoreResult<Value> {
    let query = require_str(&ctx.args, "query")?;
    let conn = sql_connection(&ctx.core.home)?;
    let mut stmt = conn
        .prepare(query)
        .map_err(|e| CoreError::ParseParam { param: "query", detail: e.to_string() })?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = stmt
        .query([])
        .map_err(|e| CoreError::ParseParam { param: "query", detail: e.to_string() })?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| CoreError::Internal(e.to_string()))? {
        let mut obj = serde_json::Map::new();
        for (idx, column) in columns.iter().enumerate() {
            obj.insert(column.clone(), row_value(row, idx));
        }
        out.push(Value::Object(obj));
    }
    Ok(json!({ "columns": columns, "rows": out }))
}

pub async fn sql_execute(ctx: CommandContext) -> CoreResult<Value> {
    let statement = require_str(&ctx.args, "statement")?;
    let conn = sql_connection(&ctx.core.home)?;
    let affected = conn
        .execute(statement, [])
        .map_err(|e| CoreError::ParseParam { param: "statement", detail: e.to_string() })?;
    Ok(json!({ "rows_affected": affected }))
}

// --- reset ---

/// Wipe the local collaboration state: inbox view, sessions, runs, and
/// the scratch database. Profiles, settings, and peer datasites are left
/// alone; remote copies are never touched.
pub async fn reset_everything(ctx: CommandContext) -> CoreResult<Value> {
    ctx.sink.status("clearing local message view");
    if let Ok(identity) = ctx.core.identity() {
        let inbox = identity.messages.paths().inbox_root();
        if inbox.exists() {
            std::fs::remove_dir_all(&inbox)?;
        }
    }

    ctx.sink.status("clearing sessions");
    let sessions = ctx.core.home.join("sessions");
    if sessions.exists() {
        std::fs::remove_dir_all(&sessions)?;
        std::fs::create_dir_all(&sessions)?;
    }

    ctx.sink.status("clearing runs and scratch db");
    let runs = ctx.core.home.join("runs");
    if runs.exists() {
        std::fs::remove_dir_all(&runs)?;
    }
    let db = ctx.core.home.join("desktop.db");
    if db.exists() {
        std::fs::remove_file(&db)?;
    }

    ctx.sink.status("clearing audit log");
    ctx.core.audit.clear().await?;

    tracing::warn!("local state reset");
    Ok(json!({ "reset": true }))
}

/// Stop the sync daemon and drop its local state directory.
pub async fn reset_syftbox(ctx: CommandContext) -> CoreResult<Value> {
    ctx.core.syftbox.stop().await?;
    let state_dir = ctx.core.data_dir.join(".syftbox");
    if state_dir.exists() {
        std::fs::remove_dir_all(&state_dir)?;
    }
    tracing::warn!("syftbox state reset");
    Ok(json!({ "reset": true }))
}
