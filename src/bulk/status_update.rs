use rusqlite::{params, Connection};

use super::error::{BulkError, BulkResult};
use super::ledger;
use super::model::{normalize_student_status, now_timestamp, BulkOperation, OperationType};

pub const PAGE_SIZE: usize = 100;

fn apply_status(conn: &Connection, tenant_id: &str, student_id: &str, new_status: &str) -> Result<(), String> {
    let changed = conn
        .execute(
            "UPDATE students SET status = ?, updated_at = ? WHERE tenant_id = ? AND id = ?",
            params![new_status, now_timestamp(), tenant_id, student_id],
        )
        .map_err(|e| e.to_string())?;
    if changed == 0 {
        return Err(format!("student not found: {student_id}"));
    }
    Ok(())
}

pub fn process(conn: &Connection, tenant_id: &str, operation_id: &str, new_status: &str) -> BulkResult<BulkOperation> {
    let op = ledger::get_operation(conn, tenant_id, operation_id, false)?;
    if op.operation_type != OperationType::StatusUpdate {
        return Err(BulkError::InvalidOperationType(format!(
            "operation {} is {}, not status_update",
            op.id, op.operation_type
        )));
    }
    if op.status.is_terminal() {
        return Ok(op);
    }
    let Some(new_status) = normalize_student_status(new_status) else {
        return Err(BulkError::InvalidStatus(format!("unknown student status: {new_status}")));
    };

    ledger::mark_started(conn, operation_id)?;

    if let Err(e) = drain(conn, tenant_id, operation_id, new_status) {
        if let Err(ledger_err) = ledger::mark_failed(conn, operation_id, &e.to_string()) {
            tracing::error!(
                operation_id = %operation_id,
                error = %e,
                ledger_error = %ledger_err,
                "could not record status update failure"
            );
        }
        return ledger::get_operation(conn, tenant_id, operation_id, false);
    }

    ledger::mark_completed(conn, operation_id, None)?;
    let op = ledger::get_operation(conn, tenant_id, operation_id, false)?;
    tracing::info!(
        operation_id = %operation_id,
        success = op.success_count,
        failed = op.failure_count,
        "status update finished"
    );
    Ok(op)
}

fn drain(conn: &Connection, tenant_id: &str, operation_id: &str, new_status: &str) -> BulkResult<()> {
    loop {
        let page = ledger::pending_items(conn, operation_id, PAGE_SIZE)?;
        if page.is_empty() {
            return Ok(());
        }
        for item in page {
            let tx = conn.unchecked_transaction()?;
            let outcome = apply_status(&tx, tenant_id, &item.student_id, new_status);
            if let Err(msg) = &outcome {
                tracing::warn!(
                    operation_id = %operation_id,
                    student_id = %item.student_id,
                    error = %msg,
                    "status update item failed"
                );
            }
            ledger::record_item_outcome(&tx, operation_id, &item.id, outcome)?;
            tx.commit()?;
        }
    }
}
