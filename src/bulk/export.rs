use rusqlite::{params_from_iter, Connection};
use rust_xlsxwriter::{Color, Format, FormatBorder, Workbook};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::error::{BulkError, BulkResult};
use super::ledger;
use super::model::{BulkOperation, OperationType};
use crate::settings::ExportSettings;

const RESOLVE_CHUNK: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "xlsx" | "excel" => Some(Self::Xlsx),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportColumn {
    AdmissionNumber,
    FirstName,
    LastName,
    FullName,
    Gender,
    DateOfBirth,
    Email,
    Phone,
    Status,
    Branch,
    Class,
    Section,
    RollNumber,
    AdmissionDate,
    BloodGroup,
    GuardianName,
    GuardianRelation,
    GuardianPhone,
    GuardianEmail,
    Address,
    City,
    State,
    PostalCode,
}

impl ExportColumn {
    pub const ALL: [ExportColumn; 23] = [
        Self::AdmissionNumber,
        Self::FirstName,
        Self::LastName,
        Self::FullName,
        Self::Gender,
        Self::DateOfBirth,
        Self::Email,
        Self::Phone,
        Self::Status,
        Self::Branch,
        Self::Class,
        Self::Section,
        Self::RollNumber,
        Self::AdmissionDate,
        Self::BloodGroup,
        Self::GuardianName,
        Self::GuardianRelation,
        Self::GuardianPhone,
        Self::GuardianEmail,
        Self::Address,
        Self::City,
        Self::State,
        Self::PostalCode,
    ];

    pub const DEFAULTS: [ExportColumn; 9] = [
        Self::AdmissionNumber,
        Self::FirstName,
        Self::LastName,
        Self::Class,
        Self::Section,
        Self::Phone,
        Self::GuardianName,
        Self::GuardianPhone,
        Self::Status,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::AdmissionNumber => "admission_number",
            Self::FirstName => "first_name",
            Self::LastName => "last_name",
            Self::FullName => "full_name",
            Self::Gender => "gender",
            Self::DateOfBirth => "date_of_birth",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Status => "status",
            Self::Branch => "branch",
            Self::Class => "class",
            Self::Section => "section",
            Self::RollNumber => "roll_number",
            Self::AdmissionDate => "admission_date",
            Self::BloodGroup => "blood_group",
            Self::GuardianName => "guardian_name",
            Self::GuardianRelation => "guardian_relation",
            Self::GuardianPhone => "guardian_phone",
            Self::GuardianEmail => "guardian_email",
            Self::Address => "address",
            Self::City => "city",
            Self::State => "state",
            Self::PostalCode => "postal_code",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::AdmissionNumber => "Admission Number",
            Self::FirstName => "First Name",
            Self::LastName => "Last Name",
            Self::FullName => "Full Name",
            Self::Gender => "Gender",
            Self::DateOfBirth => "Date of Birth",
            Self::Email => "Email",
            Self::Phone => "Phone",
            Self::Status => "Status",
            Self::Branch => "Branch",
            Self::Class => "Class",
            Self::Section => "Section",
            Self::RollNumber => "Roll Number",
            Self::AdmissionDate => "Admission Date",
            Self::BloodGroup => "Blood Group",
            Self::GuardianName => "Guardian Name",
            Self::GuardianRelation => "Guardian Relation",
            Self::GuardianPhone => "Guardian Phone",
            Self::GuardianEmail => "Guardian Email",
            Self::Address => "Address",
            Self::City => "City",
            Self::State => "State",
            Self::PostalCode => "Postal Code",
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        let k = key.trim().to_ascii_lowercase();
        Self::ALL.iter().copied().find(|c| c.key() == k)
    }

    fn value(self, r: &ExportRecord) -> String {
        let s = |v: &Option<String>| v.clone().unwrap_or_default();
        match self {
            Self::AdmissionNumber => r.admission_number.clone(),
            Self::FirstName => r.first_name.clone(),
            Self::LastName => r.last_name.clone(),
            Self::FullName => format!("{} {}", r.first_name, r.last_name).trim().to_string(),
            Self::Gender => s(&r.gender),
            Self::DateOfBirth => s(&r.date_of_birth),
            Self::Email => s(&r.email),
            Self::Phone => s(&r.phone),
            Self::Status => r.status.clone(),
            Self::Branch => s(&r.branch_name),
            Self::Class => s(&r.class_name),
            Self::Section => s(&r.section_name),
            Self::RollNumber => s(&r.roll_number),
            Self::AdmissionDate => s(&r.admission_date),
            Self::BloodGroup => s(&r.blood_group),
            Self::GuardianName => s(&r.guardian_name),
            Self::GuardianRelation => s(&r.guardian_relation),
            Self::GuardianPhone => s(&r.guardian_phone),
            Self::GuardianEmail => s(&r.guardian_email),
            Self::Address => s(&r.address),
            Self::City => s(&r.city),
            Self::State => s(&r.state),
            Self::PostalCode => s(&r.postal_code),
        }
    }
}

/// A requested column. Keys outside the catalogue keep their slot: the raw key
/// becomes the header and every value is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportField {
    Known(ExportColumn),
    Unknown(String),
}

impl ExportField {
    pub fn key(&self) -> &str {
        match self {
            Self::Known(c) => c.key(),
            Self::Unknown(k) => k.as_str(),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Known(c) => c.label(),
            Self::Unknown(k) => k.as_str(),
        }
    }

    pub fn value(&self, r: &ExportRecord) -> String {
        match self {
            Self::Known(c) => c.value(r),
            Self::Unknown(_) => String::new(),
        }
    }
}

pub fn parse_fields(columns: Option<&Value>) -> Vec<ExportField> {
    let requested = columns
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|key| match ExportColumn::parse(key) {
                    Some(c) => ExportField::Known(c),
                    None => ExportField::Unknown(key.to_string()),
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if requested.is_empty() {
        ExportColumn::DEFAULTS.iter().copied().map(ExportField::Known).collect()
    } else {
        requested
    }
}

pub fn parse_format(raw: Option<&Value>, settings: &ExportSettings) -> BulkResult<ExportFormat> {
    match raw {
        None | Some(Value::Null) => Ok(settings.default_format),
        Some(v) => {
            let s = v.as_str().unwrap_or_default();
            ExportFormat::parse(s).ok_or_else(|| BulkError::InvalidExportFormat(s.to_string()))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportRecord {
    pub student_id: String,
    pub admission_number: String,
    pub first_name: String,
    pub last_name: String,
    pub gender: Option<String>,
    pub date_of_birth: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: String,
    pub blood_group: Option<String>,
    pub admission_date: Option<String>,
    pub branch_name: Option<String>,
    pub class_name: Option<String>,
    pub section_name: Option<String>,
    pub roll_number: Option<String>,
    pub guardian_name: Option<String>,
    pub guardian_relation: Option<String>,
    pub guardian_phone: Option<String>,
    pub guardian_email: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
}

pub fn resolve_records(
    conn: &Connection,
    tenant_id: &str,
    student_ids: &[String],
) -> BulkResult<Vec<ExportRecord>> {
    let mut seen = HashSet::new();
    let ordered: Vec<&String> = student_ids.iter().filter(|id| seen.insert(id.as_str())).collect();

    let mut by_id: HashMap<String, ExportRecord> = HashMap::new();
    for chunk in ordered.chunks(RESOLVE_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!(
            "SELECT s.id, s.admission_number, s.first_name, s.last_name, s.gender, s.date_of_birth,
                    s.email, s.phone, s.status, s.blood_group, s.admission_date,
                    b.name, c.name, sec.name, e.roll_number,
                    TRIM(g.first_name || ' ' || g.last_name), g.relation, g.phone, g.email,
                    CASE WHEN a.line2 IS NULL OR a.line2 = '' THEN a.line1 ELSE a.line1 || ', ' || a.line2 END,
                    a.city, a.state, a.postal_code
             FROM students s
             LEFT JOIN branches b ON b.id = s.branch_id
             LEFT JOIN enrollments e ON e.id = (
                 SELECT id FROM enrollments
                 WHERE student_id = s.id AND status = 'active'
                 ORDER BY enrolled_at DESC, rowid DESC LIMIT 1)
             LEFT JOIN classes c ON c.id = e.class_id
             LEFT JOIN sections sec ON sec.id = e.section_id
             LEFT JOIN guardians g ON g.id = (
                 SELECT id FROM guardians
                 WHERE student_id = s.id AND is_primary = 1
                 ORDER BY rowid LIMIT 1)
             LEFT JOIN student_addresses a ON a.id = (
                 SELECT id FROM student_addresses
                 WHERE student_id = s.id AND address_type = 'current'
                 ORDER BY rowid LIMIT 1)
             WHERE s.tenant_id = ? AND s.id IN ({placeholders})"
        );
        let mut binds: Vec<&str> = Vec::with_capacity(chunk.len() + 1);
        binds.push(tenant_id);
        binds.extend(chunk.iter().map(|s| s.as_str()));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds.iter()), |r| {
            Ok(ExportRecord {
                student_id: r.get(0)?,
                admission_number: r.get(1)?,
                first_name: r.get(2)?,
                last_name: r.get(3)?,
                gender: r.get(4)?,
                date_of_birth: r.get(5)?,
                email: r.get(6)?,
                phone: r.get(7)?,
                status: r.get(8)?,
                blood_group: r.get(9)?,
                admission_date: r.get(10)?,
                branch_name: r.get(11)?,
                class_name: r.get(12)?,
                section_name: r.get(13)?,
                roll_number: r.get(14)?,
                guardian_name: r.get(15)?,
                guardian_relation: r.get(16)?,
                guardian_phone: r.get(17)?,
                guardian_email: r.get(18)?,
                address: r.get(19)?,
                city: r.get(20)?,
                state: r.get(21)?,
                postal_code: r.get(22)?,
            })
        })?;
        for rec in rows {
            let rec = rec?;
            by_id.insert(rec.student_id.clone(), rec);
        }
    }

    Ok(ordered
        .into_iter()
        .filter_map(|id| by_id.remove(id.as_str()))
        .collect())
}

pub fn render_csv(records: &[ExportRecord], fields: &[ExportField], delimiter: u8) -> BulkResult<Vec<u8>> {
    let mut w = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    w.write_record(fields.iter().map(|f| f.label()))?;
    for rec in records {
        w.write_record(fields.iter().map(|f| f.value(rec)))?;
    }
    w.into_inner().map_err(|e| BulkError::Render(e.to_string()))
}

pub fn render_xlsx(records: &[ExportRecord], fields: &[ExportField]) -> BulkResult<Vec<u8>> {
    let mut workbook = Workbook::new();
    let header = Format::new()
        .set_bold()
        .set_background_color(Color::RGB(0xD9E1F2))
        .set_border(FormatBorder::Thin);

    let sheet = workbook.add_worksheet();
    sheet.set_name("Students")?;
    for (col, field) in fields.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, field.label(), &header)?;
    }
    for (i, rec) in records.iter().enumerate() {
        let row = (i + 1) as u32;
        for (col, field) in fields.iter().enumerate() {
            let value = field.value(rec);
            if !value.is_empty() {
                sheet.write_string(row, col as u16, value)?;
            }
        }
    }
    sheet.set_freeze_panes(1, 0)?;
    sheet.autofit();

    Ok(workbook.save_to_buffer()?)
}

fn path_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

struct WrittenFile {
    result_ref: String,
    sha256: String,
    bytes: usize,
}

fn write_output(
    workspace: &Path,
    settings: &ExportSettings,
    tenant_id: &str,
    operation_id: &str,
    format: ExportFormat,
    contents: &[u8],
) -> BulkResult<WrittenFile> {
    let tenant_dir = path_segment(tenant_id);
    let file_name = format!("{}.{}", path_segment(operation_id), format.as_str());
    let dir = workspace.join(&settings.output_dir).join(&tenant_dir);
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(&file_name), contents)?;

    let output_dir = settings.output_dir.trim_end_matches('/');
    Ok(WrittenFile {
        result_ref: format!("{output_dir}/{tenant_dir}/{file_name}"),
        sha256: format!("{:x}", Sha256::digest(contents)),
        bytes: contents.len(),
    })
}

fn target_ids(conn: &Connection, operation_id: &str) -> BulkResult<Vec<String>> {
    Ok(ledger::list_items(conn, operation_id)?
        .into_iter()
        .map(|i| i.student_id)
        .collect())
}

fn complete(
    conn: &Connection,
    operation_id: &str,
    format: ExportFormat,
    row_count: usize,
    file: &WrittenFile,
) -> BulkResult<()> {
    let tx = conn.unchecked_transaction()?;
    ledger::mark_pending_items_success(&tx, operation_id)?;
    ledger::merge_parameters(
        &tx,
        operation_id,
        &json!({
            "format": format.as_str(),
            "rowCount": row_count,
            "resultSha256": file.sha256,
            "resultBytes": file.bytes
        }),
    )?;
    ledger::mark_completed(&tx, operation_id, Some(&file.result_ref))?;
    tx.commit()?;
    Ok(())
}

/// Failures after `mark_started` end the operation `failed` and come back as `Ok`.
pub fn run(
    conn: &Connection,
    workspace: &Path,
    settings: &ExportSettings,
    tenant_id: &str,
    operation_id: &str,
) -> BulkResult<BulkOperation> {
    let op = ledger::get_operation(conn, tenant_id, operation_id, false)?;
    if op.operation_type != OperationType::Export {
        return Err(BulkError::InvalidOperationType(format!(
            "operation {} is {}, not export",
            op.id, op.operation_type
        )));
    }
    if op.status.is_terminal() {
        return Ok(op);
    }
    let format = parse_format(op.parameters.get("format"), settings)?;
    let fields = parse_fields(op.parameters.get("columns"));

    ledger::mark_started(conn, operation_id)?;

    let rendered = target_ids(conn, operation_id)
        .and_then(|ids| resolve_records(conn, tenant_id, &ids))
        .and_then(|records| {
            let bytes = match format {
                ExportFormat::Csv => render_csv(&records, &fields, settings.csv_delimiter)?,
                ExportFormat::Xlsx => render_xlsx(&records, &fields)?,
            };
            Ok((records.len(), bytes))
        })
        .and_then(|(rows, bytes)| {
            write_output(workspace, settings, tenant_id, operation_id, format, &bytes)
                .map(|file| (rows, file))
        });

    let (row_count, file) = match rendered {
        Ok(v) => v,
        Err(e) => {
            ledger::mark_failed(conn, operation_id, &e.to_string())?;
            return ledger::get_operation(conn, tenant_id, operation_id, false);
        }
    };

    if let Err(e) = complete(conn, operation_id, format, row_count, &file) {
        tracing::error!(operation_id = %operation_id, error = %e, "export completion failed");
        if let Err(rm) = std::fs::remove_file(workspace.join(&file.result_ref)) {
            tracing::warn!(path = %file.result_ref, error = %rm, "could not remove export file");
        }
        ledger::mark_failed(conn, operation_id, &e.to_string())?;
        return ledger::get_operation(conn, tenant_id, operation_id, false);
    }

    tracing::info!(
        operation_id = %operation_id,
        tenant_id = %tenant_id,
        format = format.as_str(),
        rows = row_count,
        result_ref = %file.result_ref,
        "export written"
    );
    ledger::get_operation(conn, tenant_id, operation_id, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::model::{ItemStatus, OperationStatus};
    use crate::db;
    use rusqlite::params;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        conn.execute_batch(
            "INSERT INTO branches(id, tenant_id, name) VALUES('b1', 't1', 'North Campus');
             INSERT INTO academic_years(id, tenant_id, name, is_current) VALUES('y1', 't1', '2026-27', 1);
             INSERT INTO classes(id, tenant_id, name) VALUES('c1', 't1', 'Grade 5');
             INSERT INTO sections(id, tenant_id, class_id, name) VALUES('sec1', 't1', 'c1', 'A');",
        )
        .expect("seed");
        conn
    }

    fn add_student(conn: &Connection, id: &str, adm: &str, first: &str) {
        conn.execute(
            "INSERT INTO students(id, tenant_id, branch_id, admission_number, first_name, last_name, phone, status, created_at)
             VALUES(?, 't1', 'b1', ?, ?, 'Doe', '555-0100', 'active', '2026-01-01T00:00:00Z')",
            params![id, adm, first],
        )
        .expect("student");
    }

    fn temp_dir(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn unknown_columns_keep_their_slot_with_empty_values() {
        let fields = parse_fields(Some(&json!(["last_name", "shoe_size", "admission_number"])));
        assert_eq!(fields[1], ExportField::Unknown("shoe_size".to_string()));
        let rec = ExportRecord {
            admission_number: "A1".into(),
            last_name: "Doe".into(),
            ..Default::default()
        };
        let out = render_csv(&[rec], &fields, b',').expect("csv");
        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(text, "Last Name,shoe_size,Admission Number\nDoe,,A1\n");
    }

    #[test]
    fn default_columns_when_none_requested() {
        let fields = parse_fields(None);
        assert_eq!(fields.len(), 9);
        assert_eq!(fields[0].label(), "Admission Number");
        assert_eq!(fields[8].label(), "Status");
        assert_eq!(parse_fields(Some(&json!([]))).len(), 9);
    }

    #[test]
    fn format_parsing() {
        let settings = ExportSettings::default();
        assert_eq!(parse_format(None, &settings).expect("default"), ExportFormat::Csv);
        assert_eq!(
            parse_format(Some(&json!("Excel")), &settings).expect("alias"),
            ExportFormat::Xlsx
        );
        let e = parse_format(Some(&json!("pdf")), &settings).expect_err("pdf");
        assert_eq!(e.code(), "invalid_export_format");
    }

    #[test]
    fn resolves_related_rows_and_tolerates_missing_ones() {
        let conn = setup();
        add_student(&conn, "s1", "ADM1", "Ann");
        add_student(&conn, "s2", "ADM2", "Ben");
        conn.execute_batch(
            "INSERT INTO enrollments(id, tenant_id, student_id, academic_year_id, class_id, section_id, roll_number, status, enrolled_at)
               VALUES('e1', 't1', 's1', 'y1', 'c1', 'sec1', '7', 'active', '2026-01-02');
             INSERT INTO guardians(id, tenant_id, student_id, first_name, last_name, phone, is_primary)
               VALUES('g0', 't1', 's1', 'Side', 'Kick', '1', 0);
             INSERT INTO guardians(id, tenant_id, student_id, first_name, last_name, phone, is_primary)
               VALUES('g1', 't1', 's1', 'Mary', 'Doe', '555-0199', 1);
             INSERT INTO student_addresses(id, tenant_id, student_id, address_type, line1, city)
               VALUES('a0', 't1', 's1', 'permanent', 'Old Road 1', 'Elsewhere');
             INSERT INTO student_addresses(id, tenant_id, student_id, address_type, line1, line2, city)
               VALUES('a1', 't1', 's1', 'current', '12 Main St', 'Apt 4', 'Springfield');",
        )
        .expect("related");

        let ids = vec!["s2".to_string(), "nope".to_string(), "s1".to_string()];
        let records = resolve_records(&conn, "t1", &ids).expect("resolve");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].student_id, "s2");
        assert!(records[0].class_name.is_none());
        assert!(records[0].guardian_name.is_none());

        let ann = &records[1];
        assert_eq!(ann.branch_name.as_deref(), Some("North Campus"));
        assert_eq!(ann.class_name.as_deref(), Some("Grade 5"));
        assert_eq!(ann.section_name.as_deref(), Some("A"));
        assert_eq!(ann.roll_number.as_deref(), Some("7"));
        assert_eq!(ann.guardian_name.as_deref(), Some("Mary Doe"));
        assert_eq!(ann.address.as_deref(), Some("12 Main St, Apt 4"));
        assert_eq!(ann.city.as_deref(), Some("Springfield"));
    }

    #[test]
    fn run_writes_file_and_completes_every_item() {
        let conn = setup();
        add_student(&conn, "s1", "ADM1", "Ann");
        add_student(&conn, "s2", "ADM2", "Ben");
        let workspace = temp_dir("rosterd-export-unit");
        let op = ledger::create_operation(
            &conn,
            "t1",
            OperationType::Export,
            &["s1".to_string(), "s2".to_string()],
            json!({ "format": "csv", "columns": ["first_name", "admission_number"] }),
            None,
        )
        .expect("create");

        let done = run(&conn, &workspace, &ExportSettings::default(), "t1", &op.id).expect("run");
        assert_eq!(done.status, OperationStatus::Completed);
        assert_eq!(done.success_count, 2);
        assert_eq!(done.processed_count, 2);
        assert_eq!(done.parameters["rowCount"], 2);
        let result_ref = done.result_ref.expect("ref");
        assert_eq!(result_ref, format!("exports/t1/{}.csv", op.id));
        let text = std::fs::read_to_string(workspace.join(&result_ref)).expect("read");
        assert_eq!(text, "First Name,Admission Number\nAnn,ADM1\nBen,ADM2\n");
        let items = ledger::list_items(&conn, &op.id).expect("items");
        assert!(items.iter().all(|i| i.status == ItemStatus::Success));
    }

    #[test]
    fn write_failure_fails_the_whole_operation() {
        let conn = setup();
        add_student(&conn, "s1", "ADM1", "Ann");
        let workspace = temp_dir("rosterd-export-fail");
        // A plain file where the tenant directory must go.
        std::fs::create_dir_all(workspace.join("exports")).expect("dir");
        std::fs::write(workspace.join("exports").join("t1"), b"x").expect("blocker");

        let op = ledger::create_operation(&conn, "t1", OperationType::Export, &["s1".to_string()], json!({}), None)
            .expect("create");
        let done = run(&conn, &workspace, &ExportSettings::default(), "t1", &op.id).expect("run");
        assert_eq!(done.status, OperationStatus::Failed);
        assert!(done.error_message.is_some());
        assert!(done.result_ref.is_none());
        assert_eq!(done.processed_count, 0);
        let items = ledger::list_items(&conn, &op.id).expect("items");
        assert!(items.iter().all(|i| i.status == ItemStatus::Pending));
    }

    #[test]
    fn completion_failure_fails_the_operation_and_drops_the_file() {
        let conn = setup();
        add_student(&conn, "s1", "ADM1", "Ann");
        conn.execute_batch(
            "CREATE TRIGGER no_completion BEFORE UPDATE OF status ON bulk_operations
             WHEN NEW.status = 'completed'
             BEGIN SELECT RAISE(ABORT, 'ledger unavailable'); END;",
        )
        .expect("trigger");
        let workspace = temp_dir("rosterd-export-complete-fail");
        let op = ledger::create_operation(&conn, "t1", OperationType::Export, &["s1".to_string()], json!({}), None)
            .expect("create");

        let done = run(&conn, &workspace, &ExportSettings::default(), "t1", &op.id).expect("run");
        assert_eq!(done.status, OperationStatus::Failed);
        assert!(done.error_message.expect("message").contains("ledger unavailable"));
        assert!(done.result_ref.is_none());
        assert_eq!(done.success_count, 0);
        assert!(!workspace.join(format!("exports/t1/{}.csv", op.id)).exists());
        let items = ledger::list_items(&conn, &op.id).expect("items");
        assert!(items.iter().all(|i| i.status == ItemStatus::Pending));
    }

    #[test]
    fn xlsx_render_keeps_requested_columns_in_order() {
        use calamine::{open_workbook_auto_from_rs, Data, Reader};
        use std::io::Cursor;

        let records = vec![
            ExportRecord {
                admission_number: "A1".into(),
                first_name: "Ann".into(),
                last_name: "Doe".into(),
                class_name: Some("Grade 5".into()),
                ..Default::default()
            },
            ExportRecord {
                admission_number: "A2".into(),
                first_name: "Ben".into(),
                last_name: "Roy".into(),
                ..Default::default()
            },
        ];
        let fields = parse_fields(Some(&json!(["last_name", "class", "shoe_size", "admission_number"])));
        let bytes = render_xlsx(&records, &fields).expect("xlsx");

        let mut wb = open_workbook_auto_from_rs(Cursor::new(bytes)).expect("open");
        let range = wb.worksheet_range("Students").expect("sheet");
        let grid: Vec<Vec<String>> = range
            .rows()
            .map(|r| {
                r.iter()
                    .map(|c| match c {
                        Data::String(s) => s.clone(),
                        _ => String::new(),
                    })
                    .collect()
            })
            .collect();
        assert_eq!(
            grid,
            vec![
                vec!["Last Name", "Class", "shoe_size", "Admission Number"],
                vec!["Doe", "Grade 5", "", "A1"],
                vec!["Roy", "", "", "A2"],
            ]
        );
    }
}
