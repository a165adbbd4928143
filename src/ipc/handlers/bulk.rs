use crate::bulk::export::{self, ExportColumn};
use crate::bulk::ledger::{self, OperationFilter};
use crate::bulk::model::{normalize_student_status, BulkOperation, OperationStatus, OperationType};
use crate::bulk::process_operation;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_opt_bool, get_opt_str, get_opt_usize, get_required_str, get_str_list, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::settings::ExportSettings;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::path::Path;

fn to_value(op: &BulkOperation) -> Result<Value, HandlerErr> {
    serde_json::to_value(op).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn require_status(raw: &str) -> Result<&'static str, HandlerErr> {
    normalize_student_status(raw).ok_or_else(|| {
        HandlerErr::new("invalid_status", format!("unknown student status: {}", raw))
    })
}

fn handle_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let type_raw = get_required_str(params, "type")?;
    let operation_type = OperationType::parse(&type_raw).ok_or_else(|| {
        HandlerErr::new("invalid_operation_type", format!("unknown operation type: {}", type_raw))
    })?;
    let student_ids = get_str_list(params, "studentIds")?;
    let mut parameters = match params.get("parameters") {
        None | Some(Value::Null) => json!({}),
        Some(v) if v.is_object() => v.clone(),
        Some(_) => return Err(HandlerErr::bad_params("parameters must be an object")),
    };
    match operation_type {
        OperationType::StatusUpdate => {
            let raw = parameters
                .get("newStatus")
                .and_then(|v| v.as_str())
                .ok_or_else(|| HandlerErr::bad_params("missing parameters.newStatus"))?;
            parameters["newStatus"] = json!(require_status(raw)?);
        }
        OperationType::Export => {
            let settings = ExportSettings::load(conn)?;
            let format = export::parse_format(parameters.get("format"), &settings)?;
            parameters["format"] = json!(format.as_str());
        }
        OperationType::Sms | OperationType::Email => {}
    }
    let created_by = get_opt_str(params, "createdBy")?;

    let op = ledger::create_operation(
        conn,
        &tenant_id,
        operation_type,
        &student_ids,
        parameters,
        created_by.as_deref(),
    )?;
    to_value(&op)
}

fn handle_process(conn: &Connection, workspace: &Path, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let operation_id = get_required_str(params, "operationId")?;
    let settings = ExportSettings::load(conn)?;
    let op = process_operation(conn, workspace, &settings, &tenant_id, &operation_id)?;
    to_value(&op)
}

fn handle_status_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let student_ids = get_str_list(params, "studentIds")?;
    let new_status = require_status(&get_required_str(params, "newStatus")?)?;
    let created_by = get_opt_str(params, "createdBy")?;

    let op = ledger::create_operation(
        conn,
        &tenant_id,
        OperationType::StatusUpdate,
        &student_ids,
        json!({ "newStatus": new_status }),
        created_by.as_deref(),
    )?;
    let op = crate::bulk::status_update::process(conn, &tenant_id, &op.id, new_status)?;
    to_value(&op)
}

fn handle_export(conn: &Connection, workspace: &Path, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let student_ids = get_str_list(params, "studentIds")?;
    let settings = ExportSettings::load(conn)?;
    let format = export::parse_format(params.get("format"), &settings)?;
    let fields = export::parse_fields(params.get("columns"));
    let columns: Vec<&str> = fields.iter().map(|f| f.key()).collect();
    let created_by = get_opt_str(params, "createdBy")?;

    let op = ledger::create_operation(
        conn,
        &tenant_id,
        OperationType::Export,
        &student_ids,
        json!({ "format": format.as_str(), "columns": columns }),
        created_by.as_deref(),
    )?;
    let op = export::run(conn, workspace, &settings, &tenant_id, &op.id)?;
    to_value(&op)
}

fn handle_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let operation_id = get_required_str(params, "operationId")?;
    let include_items = get_opt_bool(params, "includeItems")?.unwrap_or(false);
    let op = ledger::get_operation(conn, &tenant_id, &operation_id, include_items)?;
    to_value(&op)
}

fn handle_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let operation_type = match get_opt_str(params, "type")? {
        None => None,
        Some(raw) => Some(OperationType::parse(&raw).ok_or_else(|| {
            HandlerErr::new("invalid_operation_type", format!("unknown operation type: {}", raw))
        })?),
    };
    let status = match get_opt_str(params, "status")? {
        None => None,
        Some(raw) => Some(OperationStatus::parse(&raw).ok_or_else(|| {
            HandlerErr::new("invalid_status", format!("unknown operation status: {}", raw))
        })?),
    };
    let filter = OperationFilter {
        operation_type,
        status,
        limit: get_opt_usize(params, "limit")?,
    };
    let ops = ledger::list_operations(conn, &tenant_id, &filter)?;
    let operations = ops.iter().map(to_value).collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "operations": operations }))
}

fn handle_cancel(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let operation_id = get_required_str(params, "operationId")?;
    let op = ledger::cancel_operation(conn, &tenant_id, &operation_id)?;
    to_value(&op)
}

fn handle_export_columns() -> Value {
    let columns: Vec<Value> = ExportColumn::ALL
        .iter()
        .map(|c| json!({ "key": c.key(), "label": c.label() }))
        .collect();
    let defaults: Vec<&str> = ExportColumn::DEFAULTS.iter().map(|c| c.key()).collect();
    json!({ "columns": columns, "defaults": defaults })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let method = req.method.as_str();
    if !method.starts_with("bulk.") {
        return None;
    }
    if method == "bulk.exportColumns" {
        return Some(ok(&req.id, handle_export_columns()));
    }

    let (Some(conn), Some(workspace)) = (state.db.as_ref(), state.workspace.as_deref()) else {
        return Some(HandlerErr::new("no_workspace", "select a workspace first").response(&req.id));
    };
    let p = &req.params;
    let result = match method {
        "bulk.create" => handle_create(conn, p),
        "bulk.process" => handle_process(conn, workspace, p),
        "bulk.statusUpdate" => handle_status_update(conn, p),
        "bulk.export" => handle_export(conn, workspace, p),
        "bulk.get" => handle_get(conn, p),
        "bulk.list" => handle_list(conn, p),
        "bulk.cancel" => handle_cancel(conn, p),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
