use crate::bulk::error::BulkError;
use crate::bulk::import::{self, ImportFileType, ImportRequest};
use crate::bulk::resolver::ReferenceData;
use crate::bulk::template;
use crate::ipc::error::ok;
use crate::ipc::helpers::{get_opt_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::settings::ImportSettings;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

fn resolve_path(workspace: &Path, raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        p
    } else {
        workspace.join(p)
    }
}

fn tenant_dir(tenant_id: &str) -> String {
    tenant_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn handle_template(conn: &Connection, workspace: &Path, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let out_path = match get_opt_str(params, "outPath")? {
        Some(raw) => resolve_path(workspace, &raw),
        None => workspace
            .join("templates")
            .join(tenant_dir(&tenant_id))
            .join(template::TEMPLATE_FILE_NAME),
    };

    let refs = ReferenceData::load(conn, &tenant_id)?;
    let bytes = template::render_template(&refs)?;
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).map_err(BulkError::from)?;
    }
    std::fs::write(&out_path, &bytes).map_err(BulkError::from)?;

    tracing::info!(tenant_id = %tenant_id, path = %out_path.display(), "import template written");
    Ok(json!({
        "path": out_path.to_string_lossy(),
        "bytes": bytes.len(),
        "sheets": [
            template::SHEET_STUDENTS,
            template::SHEET_INSTRUCTIONS,
            template::SHEET_CLASSES,
            template::SHEET_VALID_VALUES
        ],
        "classCount": refs.classes().len()
    }))
}

fn handle_students(conn: &Connection, workspace: &Path, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let branch_id = get_required_str(params, "branchId")?;
    let academic_year_id = get_required_str(params, "academicYearId")?;
    let actor_id = get_opt_str(params, "actorId")?;
    let in_path = resolve_path(workspace, &get_required_str(params, "inPath")?);

    let file_type = match get_opt_str(params, "fileType")? {
        Some(raw) => ImportFileType::parse(&raw).ok_or(BulkError::UnsupportedFileType(raw)),
        None => ImportFileType::from_path(&in_path).ok_or_else(|| {
            BulkError::UnsupportedFileType(in_path.to_string_lossy().to_string())
        }),
    }?;
    let bytes = std::fs::read(&in_path).map_err(BulkError::from)?;
    let settings = ImportSettings::load(conn)?;

    let result = import::import_students(
        conn,
        &settings,
        &ImportRequest {
            tenant_id: &tenant_id,
            branch_id: &branch_id,
            academic_year_id: &academic_year_id,
            actor_id: actor_id.as_deref(),
            file_type,
            bytes: &bytes,
        },
    )?;
    serde_json::to_value(&result).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let method = req.method.as_str();
    if method != "import.template" && method != "import.students" {
        return None;
    }
    let (Some(conn), Some(workspace)) = (state.db.as_ref(), state.workspace.as_deref()) else {
        return Some(HandlerErr::new("no_workspace", "select a workspace first").response(&req.id));
    };
    let result = if method == "import.template" {
        handle_template(conn, workspace, &req.params)
    } else {
        handle_students(conn, workspace, &req.params)
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
