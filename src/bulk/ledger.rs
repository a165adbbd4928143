use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

use super::error::{BulkError, BulkResult};
use super::model::{
    now_timestamp, BulkOperation, BulkOperationItem, ItemStatus, OperationStatus, OperationType,
};

const OPERATION_COLUMNS: &str = "id, tenant_id, operation_type, status, total_count, processed_count,
    success_count, failure_count, parameters, result_ref, error_message, created_by, created_at,
    started_at, completed_at";

pub const LIST_MAX_LIMIT: usize = 200;

#[derive(Debug, Clone)]
pub struct PendingItem {
    pub id: String,
    pub student_id: String,
}

#[derive(Debug, Default, Clone)]
pub struct OperationFilter {
    pub operation_type: Option<OperationType>,
    pub status: Option<OperationStatus>,
    pub limit: Option<usize>,
}

fn conversion_err(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected value: {raw}").into(),
    )
}

fn operation_from_row(r: &Row<'_>) -> rusqlite::Result<BulkOperation> {
    let type_raw: String = r.get(2)?;
    let status_raw: String = r.get(3)?;
    let params_raw: String = r.get(8)?;
    Ok(BulkOperation {
        id: r.get(0)?,
        tenant_id: r.get(1)?,
        operation_type: OperationType::parse(&type_raw).ok_or_else(|| conversion_err(2, &type_raw))?,
        status: OperationStatus::parse(&status_raw).ok_or_else(|| conversion_err(3, &status_raw))?,
        total_count: r.get(4)?,
        processed_count: r.get(5)?,
        success_count: r.get(6)?,
        failure_count: r.get(7)?,
        parameters: serde_json::from_str(&params_raw).unwrap_or_else(|_| json!({})),
        result_ref: r.get(9)?,
        error_message: r.get(10)?,
        created_by: r.get(11)?,
        created_at: r.get(12)?,
        started_at: r.get(13)?,
        completed_at: r.get(14)?,
        items: None,
    })
}

pub fn create_operation(
    conn: &Connection,
    tenant_id: &str,
    operation_type: OperationType,
    target_ids: &[String],
    parameters: Value,
    created_by: Option<&str>,
) -> BulkResult<BulkOperation> {
    if target_ids.is_empty() {
        return Err(BulkError::NoTargetsProvided);
    }
    let limit = operation_type.max_targets();
    if target_ids.len() > limit {
        return Err(BulkError::TooManyTargets {
            operation_type,
            given: target_ids.len(),
            limit,
        });
    }

    let operation_id = Uuid::new_v4().to_string();
    let now = now_timestamp();
    let parameters = if parameters.is_object() { parameters } else { json!({}) };

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO bulk_operations(id, tenant_id, operation_type, status, total_count, parameters, created_by, created_at)
         VALUES(?, ?, ?, 'pending', ?, ?, ?, ?)",
        params![
            &operation_id,
            tenant_id,
            operation_type.as_str(),
            target_ids.len() as i64,
            parameters.to_string(),
            created_by,
            &now
        ],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO bulk_operation_items(id, operation_id, student_id, seq, status)
             VALUES(?, ?, ?, ?, 'pending')",
        )?;
        for (seq, student_id) in target_ids.iter().enumerate() {
            stmt.execute(params![
                Uuid::new_v4().to_string(),
                &operation_id,
                student_id,
                seq as i64
            ])?;
        }
    }
    tx.commit()?;

    tracing::info!(
        operation_id = %operation_id,
        tenant_id = %tenant_id,
        operation_type = %operation_type,
        total = target_ids.len(),
        "bulk operation created"
    );

    get_operation(conn, tenant_id, &operation_id, false)
}

pub fn find_operation(
    conn: &Connection,
    tenant_id: &str,
    operation_id: &str,
) -> BulkResult<Option<BulkOperation>> {
    let sql = format!(
        "SELECT {OPERATION_COLUMNS} FROM bulk_operations WHERE id = ? AND tenant_id = ?"
    );
    Ok(conn
        .query_row(&sql, [operation_id, tenant_id], operation_from_row)
        .optional()?)
}

pub fn get_operation(
    conn: &Connection,
    tenant_id: &str,
    operation_id: &str,
    include_items: bool,
) -> BulkResult<BulkOperation> {
    let mut op = find_operation(conn, tenant_id, operation_id)?.ok_or_else(|| {
        BulkError::NotFound {
            what: "operation",
            id: operation_id.to_string(),
        }
    })?;
    if include_items {
        op.items = Some(list_items(conn, operation_id)?);
    }
    Ok(op)
}

pub fn list_operations(
    conn: &Connection,
    tenant_id: &str,
    filter: &OperationFilter,
) -> BulkResult<Vec<BulkOperation>> {
    let mut sql = format!("SELECT {OPERATION_COLUMNS} FROM bulk_operations WHERE tenant_id = ?");
    let mut binds: Vec<String> = vec![tenant_id.to_string()];
    if let Some(t) = filter.operation_type {
        sql.push_str(" AND operation_type = ?");
        binds.push(t.as_str().to_string());
    }
    if let Some(s) = filter.status {
        sql.push_str(" AND status = ?");
        binds.push(s.as_str().to_string());
    }
    let limit = filter.limit.unwrap_or(50).clamp(1, LIST_MAX_LIMIT);
    sql.push_str(&format!(" ORDER BY created_at DESC, rowid DESC LIMIT {limit}"));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), operation_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_items(conn: &Connection, operation_id: &str) -> BulkResult<Vec<BulkOperationItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, operation_id, student_id, status, error_message, processed_at
         FROM bulk_operation_items WHERE operation_id = ? ORDER BY seq",
    )?;
    let items = stmt
        .query_map([operation_id], |r| {
            let status_raw: String = r.get(3)?;
            Ok(BulkOperationItem {
                id: r.get(0)?,
                operation_id: r.get(1)?,
                student_id: r.get(2)?,
                status: ItemStatus::parse(&status_raw).ok_or_else(|| conversion_err(3, &status_raw))?,
                error_message: r.get(4)?,
                processed_at: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn pending_items(
    conn: &Connection,
    operation_id: &str,
    limit: usize,
) -> BulkResult<Vec<PendingItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id FROM bulk_operation_items
         WHERE operation_id = ? AND status = 'pending'
         ORDER BY seq LIMIT ?",
    )?;
    let items = stmt
        .query_map(params![operation_id, limit as i64], |r| {
            Ok(PendingItem {
                id: r.get(0)?,
                student_id: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn mark_started(conn: &Connection, operation_id: &str) -> BulkResult<bool> {
    let changed = conn.execute(
        "UPDATE bulk_operations SET status = 'processing', started_at = COALESCE(started_at, ?)
         WHERE id = ? AND status = 'pending'",
        params![now_timestamp(), operation_id],
    )?;
    if changed > 0 {
        tracing::info!(operation_id = %operation_id, "bulk operation started");
    }
    Ok(changed > 0)
}

pub fn mark_completed(
    conn: &Connection,
    operation_id: &str,
    result_ref: Option<&str>,
) -> BulkResult<bool> {
    let changed = conn.execute(
        "UPDATE bulk_operations SET status = 'completed', result_ref = COALESCE(?, result_ref), completed_at = ?
         WHERE id = ? AND status = 'processing'",
        params![result_ref, now_timestamp(), operation_id],
    )?;
    if changed > 0 {
        tracing::info!(operation_id = %operation_id, result_ref = ?result_ref, "bulk operation completed");
    } else {
        tracing::warn!(operation_id = %operation_id, "completion ignored: operation is not processing");
    }
    Ok(changed > 0)
}

pub fn mark_failed(conn: &Connection, operation_id: &str, message: &str) -> BulkResult<bool> {
    let changed = conn.execute(
        "UPDATE bulk_operations SET status = 'failed', error_message = ?, completed_at = ?
         WHERE id = ? AND status IN ('pending', 'processing')",
        params![message, now_timestamp(), operation_id],
    )?;
    if changed > 0 {
        tracing::error!(operation_id = %operation_id, error = %message, "bulk operation failed");
    } else {
        tracing::warn!(operation_id = %operation_id, "failure ignored: operation already terminal");
    }
    Ok(changed > 0)
}

pub fn cancel_operation(
    conn: &Connection,
    tenant_id: &str,
    operation_id: &str,
) -> BulkResult<BulkOperation> {
    let op = get_operation(conn, tenant_id, operation_id, false)?;
    if op.status != OperationStatus::Pending {
        return Err(BulkError::InvalidStatus(format!(
            "only pending operations can be cancelled (status is {})",
            op.status.as_str()
        )));
    }
    conn.execute(
        "UPDATE bulk_operations SET status = 'cancelled', completed_at = ?
         WHERE id = ? AND status = 'pending'",
        params![now_timestamp(), operation_id],
    )?;
    tracing::info!(operation_id = %operation_id, tenant_id = %tenant_id, "bulk operation cancelled");
    get_operation(conn, tenant_id, operation_id, false)
}

// Run inside the item's own transaction. Non-pending items are left alone.
pub fn record_item_outcome(
    conn: &Connection,
    operation_id: &str,
    item_id: &str,
    outcome: Result<(), String>,
) -> BulkResult<bool> {
    let (status, message) = match &outcome {
        Ok(()) => (ItemStatus::Success, None),
        Err(m) => (ItemStatus::Failed, Some(m.as_str())),
    };
    let changed = conn.execute(
        "UPDATE bulk_operation_items SET status = ?, error_message = ?, processed_at = ?
         WHERE id = ? AND operation_id = ? AND status = 'pending'",
        params![status.as_str(), message, now_timestamp(), item_id, operation_id],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    let (ok_inc, fail_inc) = if outcome.is_ok() { (1, 0) } else { (0, 1) };
    let bumped = conn.execute(
        "UPDATE bulk_operations
         SET processed_count = processed_count + 1,
             success_count = success_count + ?,
             failure_count = failure_count + ?
         WHERE id = ? AND processed_count < total_count",
        params![ok_inc, fail_inc, operation_id],
    )?;
    if bumped == 0 {
        return Err(BulkError::InvalidStatus(format!(
            "operation {operation_id} counters already at total"
        )));
    }
    Ok(true)
}

pub fn mark_pending_items_success(conn: &Connection, operation_id: &str) -> BulkResult<usize> {
    let changed = conn.execute(
        "UPDATE bulk_operation_items SET status = 'success', processed_at = ?
         WHERE operation_id = ? AND status = 'pending'",
        params![now_timestamp(), operation_id],
    )?;
    conn.execute(
        "UPDATE bulk_operations
         SET processed_count = processed_count + ?1, success_count = success_count + ?1
         WHERE id = ?2",
        params![changed as i64, operation_id],
    )?;
    Ok(changed)
}

pub fn merge_parameters(conn: &Connection, operation_id: &str, patch: &Value) -> BulkResult<()> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT parameters FROM bulk_operations WHERE id = ?",
            [operation_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Err(BulkError::NotFound {
            what: "operation",
            id: operation_id.to_string(),
        });
    };
    let mut current: Value = serde_json::from_str(&raw).unwrap_or_else(|_| json!({}));
    if let (Some(obj), Some(patch_obj)) = (current.as_object_mut(), patch.as_object()) {
        for (k, v) in patch_obj {
            obj.insert(k.clone(), v.clone());
        }
    }
    conn.execute(
        "UPDATE bulk_operations SET parameters = ? WHERE id = ?",
        params![current.to_string(), operation_id],
    )?;
    Ok(())
}
