use serde_json::{json, Value};
use thiserror::Error;

use super::model::OperationType;

#[derive(Debug, Error)]
pub enum BulkError {
    #[error("no target students provided")]
    NoTargetsProvided,

    #[error("too many targets for {operation_type} operation: {given} > {limit}")]
    TooManyTargets {
        operation_type: OperationType,
        given: usize,
        limit: usize,
    },

    #[error("unsupported export format: {0}")]
    InvalidExportFormat(String),

    #[error("unsupported operation type: {0}")]
    InvalidOperationType(String),

    #[error("{0}")]
    InvalidStatus(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("import file contains no data rows")]
    EmptyImportFile,

    #[error("import file has {given} data rows; the maximum is {limit}")]
    TooManyImportRows { given: usize, limit: usize },

    #[error("unsupported import file type: {0}")]
    UnsupportedFileType(String),

    #[error("could not read import file: {0}")]
    Parse(String),

    #[error("{0}")]
    BadParams(String),

    #[error("failed to render export file: {0}")]
    Render(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BulkError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoTargetsProvided => "no_targets",
            Self::TooManyTargets { .. } => "too_many_targets",
            Self::InvalidExportFormat(_) => "invalid_export_format",
            Self::InvalidOperationType(_) => "invalid_operation_type",
            Self::InvalidStatus(_) => "invalid_status",
            Self::NotFound { .. } => "not_found",
            Self::EmptyImportFile => "empty_import",
            Self::TooManyImportRows { .. } => "too_many_rows",
            Self::UnsupportedFileType(_) => "unsupported_file_type",
            Self::Parse(_) => "parse_failed",
            Self::BadParams(_) => "bad_params",
            Self::Render(_) => "render_failed",
            Self::Db(_) => "db_query_failed",
            Self::Io(_) => "io_failed",
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::TooManyTargets {
                operation_type,
                given,
                limit,
            } => Some(json!({
                "operationType": operation_type.as_str(),
                "given": given,
                "limit": limit
            })),
            Self::TooManyImportRows { given, limit } => Some(json!({
                "given": given,
                "limit": limit
            })),
            Self::NotFound { what, id } => Some(json!({ "entity": what, "id": id })),
            _ => None,
        }
    }
}

impl From<rust_xlsxwriter::XlsxError> for BulkError {
    fn from(e: rust_xlsxwriter::XlsxError) -> Self {
        Self::Render(e.to_string())
    }
}

impl From<csv::Error> for BulkError {
    fn from(e: csv::Error) -> Self {
        Self::Render(e.to_string())
    }
}

pub type BulkResult<T> = Result<T, BulkError>;
