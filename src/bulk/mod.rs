pub mod error;
pub mod export;
pub mod import;
pub mod ledger;
pub mod model;
pub mod resolver;
pub mod schema;
pub mod status_update;
pub mod template;

use rusqlite::Connection;
use std::path::Path;

use crate::settings::ExportSettings;
use error::{BulkError, BulkResult};
use model::{BulkOperation, OperationType};

pub fn process_operation(
    conn: &Connection,
    workspace: &Path,
    export_settings: &ExportSettings,
    tenant_id: &str,
    operation_id: &str,
) -> BulkResult<BulkOperation> {
    let op = ledger::get_operation(conn, tenant_id, operation_id, false)?;
    match op.operation_type {
        OperationType::StatusUpdate => {
            let new_status = op
                .parameters
                .get("newStatus")
                .and_then(|v| v.as_str())
                .ok_or_else(|| BulkError::BadParams("operation has no parameters.newStatus".into()))?;
            status_update::process(conn, tenant_id, operation_id, new_status)
        }
        OperationType::Export => export::run(conn, workspace, export_settings, tenant_id, operation_id),
        OperationType::Sms | OperationType::Email => Err(BulkError::InvalidOperationType(format!(
            "{} operations are not processed by this service",
            op.operation_type
        ))),
    }
}
