use crate::bulk::export::ExportFormat;
use crate::bulk::model::normalize_student_status;
use crate::db;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

/// Hard ceiling on import data rows; `imports.maxRows` may only lower it.
pub const IMPORT_MAX_ROWS: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupSection {
    Exports,
    Imports,
}

impl SetupSection {
    pub const ALL: [SetupSection; 2] = [SetupSection::Exports, SetupSection::Imports];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exports" => Some(Self::Exports),
            "imports" => Some(Self::Imports),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Exports => "exports",
            Self::Imports => "imports",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Exports => "setup.exports",
            Self::Imports => "setup.imports",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Exports => json!({
            "defaultFormat": "csv",
            "outputDir": "exports",
            "csvDelimiter": ","
        }),
        SetupSection::Imports => json!({
            "maxRows": IMPORT_MAX_ROWS,
            "defaultStudentStatus": "active"
        }),
    }
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_relative_dir(v: &Value, key: &str) -> Result<String, String> {
    let s = parse_string_max(v, key, 120)?;
    if s.is_empty() {
        return Err(format!("{} must not be empty", key));
    }
    let p = std::path::Path::new(&s);
    let escapes = p.components().any(|c| {
        !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir)
    });
    if escapes {
        return Err(format!("{} must be a relative path inside the workspace", key));
    }
    Ok(s)
}

pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Exports => match k.as_str() {
                "defaultFormat" => {
                    let raw = parse_string_max(v, k, 16)?;
                    let format = ExportFormat::parse(&raw)
                        .ok_or_else(|| "defaultFormat must be one of: csv, xlsx".to_string())?;
                    obj.insert(k.clone(), Value::String(format.as_str().to_string()));
                }
                "outputDir" => {
                    obj.insert(k.clone(), Value::String(parse_relative_dir(v, k)?));
                }
                "csvDelimiter" => {
                    // Not trimmed: a tab is a legal delimiter.
                    let s = v.as_str().ok_or_else(|| format!("{} must be string", k))?;
                    if !matches!(s, "," | ";" | "\t" | "|") {
                        return Err("csvDelimiter must be one of: ',', ';', '\\t', '|'".into());
                    }
                    obj.insert(k.clone(), Value::String(s.to_string()));
                }
                _ => return Err(format!("unknown exports field: {}", k)),
            },
            SetupSection::Imports => match k.as_str() {
                "maxRows" => {
                    obj.insert(
                        k.clone(),
                        Value::from(parse_i64_range(v, k, 1, IMPORT_MAX_ROWS as i64)?),
                    );
                }
                "defaultStudentStatus" => {
                    let s = parse_string_max(v, k, 24)?;
                    let status = normalize_student_status(&s)
                        .ok_or_else(|| format!("unknown student status: {}", s))?;
                    obj.insert(k.clone(), Value::String(status.to_string()));
                }
                _ => return Err(format!("unknown imports field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                let _ = merge_section_patch(section, &mut current, &one);
            }
        }
    }
    Ok(current)
}

pub fn update_section(
    conn: &Connection,
    section: SetupSection,
    patch: &Map<String, Value>,
) -> anyhow::Result<Result<Value, String>> {
    let mut current = load_section(conn, section)?;
    if let Err(msg) = merge_section_patch(section, &mut current, patch) {
        return Ok(Err(msg));
    }
    db::settings_set_json(conn, section.key(), &current)?;
    Ok(Ok(current))
}

#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub default_format: ExportFormat,
    pub output_dir: String,
    pub csv_delimiter: u8,
}

impl ExportSettings {
    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        let v = load_section(conn, SetupSection::Exports)?;
        Ok(Self {
            default_format: v["defaultFormat"]
                .as_str()
                .and_then(ExportFormat::parse)
                .unwrap_or(ExportFormat::Csv),
            output_dir: v["outputDir"].as_str().unwrap_or("exports").to_string(),
            csv_delimiter: v["csvDelimiter"]
                .as_str()
                .and_then(|s| s.bytes().next())
                .unwrap_or(b','),
        })
    }
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            default_format: ExportFormat::Csv,
            output_dir: "exports".to_string(),
            csv_delimiter: b',',
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub max_rows: usize,
    pub default_student_status: String,
}

impl ImportSettings {
    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        let v = load_section(conn, SetupSection::Imports)?;
        Ok(Self {
            max_rows: v["maxRows"]
                .as_u64()
                .map(|n| (n as usize).min(IMPORT_MAX_ROWS))
                .unwrap_or(IMPORT_MAX_ROWS),
            default_student_status: v["defaultStudentStatus"]
                .as_str()
                .unwrap_or("active")
                .to_string(),
        })
    }
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            max_rows: IMPORT_MAX_ROWS,
            default_student_status: "active".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        conn
    }

    #[test]
    fn defaults_apply_without_saved_sections() {
        let conn = conn();
        let exports = ExportSettings::load(&conn).expect("exports");
        assert_eq!(exports.default_format, ExportFormat::Csv);
        assert_eq!(exports.output_dir, "exports");
        assert_eq!(exports.csv_delimiter, b',');
        let imports = ImportSettings::load(&conn).expect("imports");
        assert_eq!(imports.max_rows, IMPORT_MAX_ROWS);
    }

    #[test]
    fn patch_validation() {
        let conn = conn();
        let patch = json!({ "maxRows": 501 });
        let res = update_section(&conn, SetupSection::Imports, patch.as_object().expect("obj"))
            .expect("db");
        assert!(res.is_err());

        let patch = json!({ "outputDir": "../outside" });
        let res = update_section(&conn, SetupSection::Exports, patch.as_object().expect("obj"))
            .expect("db");
        assert!(res.is_err());

        let patch = json!({ "defaultFormat": "excel", "csvDelimiter": ";" });
        let res = update_section(&conn, SetupSection::Exports, patch.as_object().expect("obj"))
            .expect("db");
        assert_eq!(res.expect("valid")["defaultFormat"], "xlsx");
        let exports = ExportSettings::load(&conn).expect("exports");
        assert_eq!(exports.default_format, ExportFormat::Xlsx);
        assert_eq!(exports.csv_delimiter, b';');
    }
}
