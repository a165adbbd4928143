use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::Path;
use uuid::Uuid;

use super::error::{BulkError, BulkResult};
use super::model::now_timestamp;
use super::resolver::ReferenceData;
use super::schema::{self, ImportField, DATE_FORMATS, GENDERS, IMPORT_COLUMNS};
use crate::settings::ImportSettings;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportFileType {
    Csv,
    Xlsx,
    Xls,
    Ods,
}

impl ImportFileType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "csv" | "text/csv" => Some(Self::Csv),
            "xlsx" | "excel" => Some(Self::Xlsx),
            "xls" => Some(Self::Xls),
            "ods" => Some(Self::Ods),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::parse)
    }
}

#[derive(Debug, Clone)]
pub struct StudentImportRow {
    /// 1-based sheet row number (the header is row 1 in the template).
    pub row_number: usize,
    cells: Vec<String>,
}

impl StudentImportRow {
    pub fn new(row_number: usize, cells: Vec<String>) -> Self {
        Self { row_number, cells }
    }

    pub fn get(&self, field: ImportField) -> &str {
        self.cells
            .get(schema::position(field))
            .map(|s| s.trim())
            .unwrap_or("")
    }

    fn opt(&self, field: ImportField) -> Option<String> {
        let v = self.get(field);
        if v.is_empty() {
            None
        } else {
            Some(v.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImportError {
    pub row: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub message: String,
}

impl ImportError {
    fn at(row: usize, field: ImportField, message: impl Into<String>) -> Self {
        Self {
            row,
            column: Some(schema::column(field).key.to_string()),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub total_rows: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub errors: Vec<ImportError>,
    pub created_student_ids: Vec<String>,
}

pub struct ImportRequest<'a> {
    pub tenant_id: &'a str,
    pub branch_id: &'a str,
    pub academic_year_id: &'a str,
    pub actor_id: Option<&'a str>,
    pub file_type: ImportFileType,
    pub bytes: &'a [u8],
}

fn sniff_delimiter(data: &[u8]) -> u8 {
    let first_line = data.split(|b| *b == b'\n').next().unwrap_or(&[]);
    let count = |d: u8| first_line.iter().filter(|b| **b == d).count();
    let mut best = (b',', count(b','));
    for d in [b';', b'\t'] {
        let n = count(d);
        if n > best.1 {
            best = (d, n);
        }
    }
    best.0
}

type Grid = Vec<(usize, Vec<String>)>;

fn csv_grid(bytes: &[u8]) -> BulkResult<Grid> {
    let data = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(sniff_delimiter(data))
        .from_reader(data);
    let mut grid = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| BulkError::Parse(e.to_string()))?;
        let line = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(idx + 1);
        grid.push((line, record.iter().map(|s| s.trim().to_string()).collect()));
    }
    Ok(grid)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) => s.trim().to_string(),
        // Phone numbers and roll numbers typed into Excel arrive as floats.
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.date().format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| dt.as_f64().to_string()),
        Data::DateTimeIso(s) => s.chars().take(10).collect(),
        Data::DurationIso(s) => s.clone(),
    }
}

fn sheet_grid(bytes: &[u8]) -> BulkResult<Grid> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| BulkError::Parse(e.to_string()))?;
    let names = workbook.sheet_names();
    let name = names
        .iter()
        .find(|n| n.eq_ignore_ascii_case("students"))
        .or_else(|| names.first())
        .cloned()
        .ok_or_else(|| BulkError::Parse("workbook has no sheets".to_string()))?;
    let range = workbook
        .worksheet_range(&name)
        .map_err(|e| BulkError::Parse(e.to_string()))?;

    // Ranges start at the first used cell; pad back to absolute A1 positions.
    let (row_offset, col_offset) = range
        .start()
        .map(|(r, c)| (r as usize, c as usize))
        .unwrap_or((0, 0));
    let mut grid = Vec::new();
    for (i, row) in range.rows().enumerate() {
        let mut cells = vec![String::new(); col_offset];
        cells.extend(row.iter().map(cell_text));
        grid.push((row_offset + i + 1, cells));
    }
    Ok(grid)
}

fn is_header_row(cells: &[String]) -> bool {
    let first = cells
        .first()
        .map(|s| s.trim_end_matches('*').trim().to_ascii_lowercase())
        .unwrap_or_default();
    let admission = schema::column(ImportField::AdmissionNumber);
    first == admission.label.to_ascii_lowercase() || first == admission.key
}

pub fn read_rows(bytes: &[u8], file_type: ImportFileType) -> BulkResult<Vec<StudentImportRow>> {
    let grid = match file_type {
        ImportFileType::Csv => csv_grid(bytes)?,
        ImportFileType::Xlsx | ImportFileType::Xls | ImportFileType::Ods => sheet_grid(bytes)?,
    };

    let mut rows = Vec::new();
    let mut header_checked = false;
    for (row_number, cells) in grid {
        let leading_blank = cells.first().map(|c| c.trim().is_empty()).unwrap_or(true);
        if leading_blank {
            continue;
        }
        if !header_checked {
            header_checked = true;
            if is_header_row(&cells) {
                continue;
            }
        }
        rows.push(StudentImportRow::new(row_number, cells));
    }
    Ok(rows)
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    for (fmt, _) in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(d);
        }
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.date())
}

fn normalize_gender(raw: &str) -> Option<&'static str> {
    let g = raw.trim().to_ascii_lowercase();
    let g = match g.as_str() {
        "m" => "male",
        "f" => "female",
        "o" => "other",
        other => other,
    };
    GENDERS.iter().copied().find(|x| *x == g)
}

fn date_formats_hint() -> String {
    let names: Vec<&str> = DATE_FORMATS.iter().map(|(_, n)| *n).collect();
    names.join(", ")
}

#[derive(Debug, Clone)]
struct GuardianInput {
    first_name: String,
    last_name: String,
    relation: Option<String>,
    phone: String,
    email: Option<String>,
}

#[derive(Debug, Clone)]
struct AddressInput {
    line1: String,
    city: Option<String>,
    state: Option<String>,
    postal_code: Option<String>,
    country: Option<String>,
}

#[derive(Debug, Clone)]
struct ValidRow {
    row_number: usize,
    admission_number: String,
    first_name: String,
    last_name: String,
    date_of_birth: NaiveDate,
    gender: &'static str,
    class_id: String,
    section_id: String,
    roll_number: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    admission_date: Option<NaiveDate>,
    blood_group: Option<String>,
    guardian: Option<GuardianInput>,
    address: Option<AddressInput>,
}

pub fn split_guardian_name(full: &str) -> (String, String) {
    let full = full.trim();
    match full.split_once(char::is_whitespace) {
        Some((first, rest)) => (first.to_string(), rest.trim().to_string()),
        None => (full.to_string(), String::new()),
    }
}

struct RowValidator<'a> {
    refs: &'a ReferenceData,
    existing_admissions: &'a HashSet<String>,
    seen_admissions: HashMap<String, usize>,
    today: NaiveDate,
}

impl RowValidator<'_> {
    fn validate(&mut self, row: &StudentImportRow) -> Result<ValidRow, Vec<ImportError>> {
        let n = row.row_number;
        let mut errors = Vec::new();

        for c in IMPORT_COLUMNS.iter().filter(|c| c.required) {
            if row.get(c.field).is_empty() {
                errors.push(ImportError::at(n, c.field, format!("{} is required", c.label)));
            }
        }

        let admission_number = row.get(ImportField::AdmissionNumber).to_string();
        if !admission_number.is_empty() {
            if let Some(first) = self.seen_admissions.get(&admission_number) {
                errors.push(ImportError::at(
                    n,
                    ImportField::AdmissionNumber,
                    format!("duplicate admission number '{admission_number}' (first used on row {first})"),
                ));
            } else {
                self.seen_admissions.insert(admission_number.clone(), n);
                if self.existing_admissions.contains(&admission_number) {
                    errors.push(ImportError::at(
                        n,
                        ImportField::AdmissionNumber,
                        format!("admission number '{admission_number}' already exists"),
                    ));
                }
            }
        }

        let dob_raw = row.get(ImportField::DateOfBirth);
        let date_of_birth = if dob_raw.is_empty() {
            None
        } else {
            match parse_date(dob_raw) {
                Some(d) if d > self.today => {
                    errors.push(ImportError::at(n, ImportField::DateOfBirth, "date of birth is in the future"));
                    None
                }
                Some(d) => Some(d),
                None => {
                    errors.push(ImportError::at(
                        n,
                        ImportField::DateOfBirth,
                        format!("invalid date '{dob_raw}'; expected {}", date_formats_hint()),
                    ));
                    None
                }
            }
        };

        let gender_raw = row.get(ImportField::Gender);
        let gender = if gender_raw.is_empty() {
            None
        } else {
            let g = normalize_gender(gender_raw);
            if g.is_none() {
                errors.push(ImportError::at(
                    n,
                    ImportField::Gender,
                    format!("gender must be one of: {}", GENDERS.join(", ")),
                ));
            }
            g
        };

        let class_name = row.get(ImportField::ClassName);
        let section_name = row.get(ImportField::SectionName);
        let mut class_id = None;
        let mut section_id = None;
        if !class_name.is_empty() {
            match self.refs.class_id(class_name) {
                Some(id) => {
                    class_id = Some(id.to_string());
                    if !section_name.is_empty() {
                        match self.refs.section_id(class_name, section_name) {
                            Some(sid) => section_id = Some(sid.to_string()),
                            None => errors.push(ImportError::at(
                                n,
                                ImportField::SectionName,
                                format!("section '{section_name}' does not exist in class '{class_name}'"),
                            )),
                        }
                    }
                }
                None => errors.push(ImportError::at(
                    n,
                    ImportField::ClassName,
                    format!("class '{class_name}' does not exist"),
                )),
            }
        }

        let admission_date = match row.opt(ImportField::AdmissionDate) {
            None => None,
            Some(raw) => {
                let d = parse_date(&raw);
                if d.is_none() {
                    errors.push(ImportError::at(
                        n,
                        ImportField::AdmissionDate,
                        format!("invalid date '{raw}'; expected {}", date_formats_hint()),
                    ));
                }
                d
            }
        };

        for field in [ImportField::Email, ImportField::GuardianEmail] {
            if let Some(email) = row.opt(field) {
                if !email.contains('@') {
                    errors.push(ImportError::at(n, field, format!("invalid email '{email}'")));
                }
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        let (Some(date_of_birth), Some(gender), Some(class_id), Some(section_id)) =
            (date_of_birth, gender, class_id, section_id)
        else {
            return Err(vec![ImportError {
                row: n,
                column: None,
                message: "row is incomplete".to_string(),
            }]);
        };

        let guardian = match (row.opt(ImportField::GuardianName), row.opt(ImportField::GuardianPhone)) {
            (Some(name), Some(phone)) => {
                let (first_name, last_name) = split_guardian_name(&name);
                Some(GuardianInput {
                    first_name,
                    last_name,
                    relation: row.opt(ImportField::GuardianRelation).map(|r| r.to_ascii_lowercase()),
                    phone,
                    email: row.opt(ImportField::GuardianEmail),
                })
            }
            _ => None,
        };
        let address = row.opt(ImportField::AddressLine).map(|line1| AddressInput {
            line1,
            city: row.opt(ImportField::City),
            state: row.opt(ImportField::State),
            postal_code: row.opt(ImportField::PostalCode),
            country: row.opt(ImportField::Country),
        });

        Ok(ValidRow {
            row_number: n,
            admission_number,
            first_name: row.get(ImportField::FirstName).to_string(),
            last_name: row.get(ImportField::LastName).to_string(),
            date_of_birth,
            gender,
            class_id,
            section_id,
            roll_number: row.opt(ImportField::RollNumber),
            email: row.opt(ImportField::Email),
            phone: row.opt(ImportField::Phone),
            admission_date,
            blood_group: row.opt(ImportField::BloodGroup),
            guardian,
            address,
        })
    }
}

struct WriteContext<'a> {
    tenant_id: &'a str,
    branch_id: &'a str,
    academic_year_id: &'a str,
    actor_id: Option<&'a str>,
    student_status: &'a str,
    now: String,
}

fn create_student(tx: &Connection, ctx: &WriteContext<'_>, row: &ValidRow) -> rusqlite::Result<String> {
    let student_id = Uuid::new_v4().to_string();
    let admission_date = row.admission_date.map(|d| d.format("%Y-%m-%d").to_string());
    tx.execute(
        "INSERT INTO students(id, tenant_id, branch_id, admission_number, first_name, last_name, date_of_birth,
                              gender, email, phone, blood_group, admission_date, status, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            &student_id,
            ctx.tenant_id,
            ctx.branch_id,
            &row.admission_number,
            &row.first_name,
            &row.last_name,
            row.date_of_birth.format("%Y-%m-%d").to_string(),
            row.gender,
            &row.email,
            &row.phone,
            &row.blood_group,
            &admission_date,
            ctx.student_status,
            ctx.actor_id,
            &ctx.now,
            &ctx.now
        ],
    )?;

    tx.execute(
        "INSERT INTO enrollments(id, tenant_id, student_id, academic_year_id, class_id, section_id, roll_number, status, enrolled_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 'active', ?)",
        params![
            Uuid::new_v4().to_string(),
            ctx.tenant_id,
            &student_id,
            ctx.academic_year_id,
            &row.class_id,
            &row.section_id,
            &row.roll_number,
            admission_date.as_deref().unwrap_or(&ctx.now)
        ],
    )?;

    if let Some(g) = &row.guardian {
        tx.execute(
            "INSERT INTO guardians(id, tenant_id, student_id, first_name, last_name, relation, phone, email, is_primary)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1)",
            params![
                Uuid::new_v4().to_string(),
                ctx.tenant_id,
                &student_id,
                &g.first_name,
                &g.last_name,
                &g.relation,
                &g.phone,
                &g.email
            ],
        )?;
    }

    if let Some(a) = &row.address {
        tx.execute(
            "INSERT INTO student_addresses(id, tenant_id, student_id, address_type, line1, city, state, postal_code, country)
             VALUES(?, ?, ?, 'current', ?, ?, ?, ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                ctx.tenant_id,
                &student_id,
                &a.line1,
                &a.city,
                &a.state,
                &a.postal_code,
                &a.country
            ],
        )?;
    }

    Ok(student_id)
}

fn ensure_exists(conn: &Connection, table: &'static str, what: &'static str, tenant_id: &str, id: &str) -> BulkResult<()> {
    let sql = format!("SELECT 1 FROM {table} WHERE id = ? AND tenant_id = ?");
    let found: Option<i64> = conn.query_row(&sql, [id, tenant_id], |r| r.get(0)).optional()?;
    if found.is_none() {
        return Err(BulkError::NotFound {
            what,
            id: id.to_string(),
        });
    }
    Ok(())
}

fn existing_admission_numbers(conn: &Connection, tenant_id: &str) -> BulkResult<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT admission_number FROM students WHERE tenant_id = ?")?;
    let set = stmt
        .query_map([tenant_id], |r| r.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(set)
}

pub fn import_students(
    conn: &Connection,
    settings: &ImportSettings,
    req: &ImportRequest<'_>,
) -> BulkResult<ImportResult> {
    ensure_exists(conn, "branches", "branch", req.tenant_id, req.branch_id)?;
    ensure_exists(conn, "academic_years", "academic year", req.tenant_id, req.academic_year_id)?;

    let rows = read_rows(req.bytes, req.file_type)?;
    if rows.is_empty() {
        return Err(BulkError::EmptyImportFile);
    }
    if rows.len() > settings.max_rows {
        return Err(BulkError::TooManyImportRows {
            given: rows.len(),
            limit: settings.max_rows,
        });
    }

    let refs = ReferenceData::load(conn, req.tenant_id)?;
    let existing = existing_admission_numbers(conn, req.tenant_id)?;
    let mut validator = RowValidator {
        refs: &refs,
        existing_admissions: &existing,
        seen_admissions: HashMap::new(),
        today: chrono::Utc::now().date_naive(),
    };
    let ctx = WriteContext {
        tenant_id: req.tenant_id,
        branch_id: req.branch_id,
        academic_year_id: req.academic_year_id,
        actor_id: req.actor_id,
        student_status: &settings.default_student_status,
        now: now_timestamp(),
    };

    let mut result = ImportResult {
        total_rows: rows.len(),
        ..Default::default()
    };

    for row in &rows {
        let valid = match validator.validate(row) {
            Ok(v) => v,
            Err(mut errs) => {
                result.failure_count += 1;
                result.errors.append(&mut errs);
                continue;
            }
        };

        let tx = conn.unchecked_transaction()?;
        let written = create_student(&tx, &ctx, &valid).and_then(|id| tx.commit().map(|()| id));
        match written {
            Ok(student_id) => {
                result.success_count += 1;
                result.created_student_ids.push(student_id);
            }
            Err(e) => {
                tracing::warn!(
                    tenant_id = %req.tenant_id,
                    row = valid.row_number,
                    error = %e,
                    "import row rolled back"
                );
                result.failure_count += 1;
                result.errors.push(ImportError {
                    row: valid.row_number,
                    column: None,
                    message: format!("failed to create student: {e}"),
                });
            }
        }
    }

    tracing::info!(
        tenant_id = %req.tenant_id,
        total = result.total_rows,
        success = result.success_count,
        failed = result.failure_count,
        "student import finished"
    );
    Ok(result)
}
