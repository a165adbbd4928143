use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rosterd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rosterd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .cloned()
            .unwrap_or_else(|| json!({ "code": "unknown" }))
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

const HEADER: &str = "Admission Number *,First Name *,Last Name *,Date of Birth *,Gender *,Class *,Section *,Roll Number,Email,Phone,Admission Date,Blood Group,Guardian Name *,Guardian Relation,Guardian Phone *,Guardian Email,Address,City,State,Postal Code,Country";

fn student_row(adm: &str, first: &str) -> String {
    format!("{adm},{first},Rao,14/06/2015,female,Grade 5,A,1,,,,,Ravi Rao,father,9000000001,,12 MG Road,Pune,,,")
}

/// Selects the workspace, creates tenant `t1` reference data and imports
/// `count` students. Returns (branchId, academicYearId, studentIds).
fn seed(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
    count: usize,
) -> (String, String, Vec<String>) {
    request_ok(stdin, reader, "s0", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let branch = request_ok(stdin, reader, "s1", "branches.create", json!({ "tenantId": "t1", "name": "Main" }));
    let branch_id = branch["branchId"].as_str().expect("branchId").to_string();
    let year = request_ok(
        stdin,
        reader,
        "s2",
        "academicYears.create",
        json!({ "tenantId": "t1", "name": "2026-27", "isCurrent": true }),
    );
    let year_id = year["academicYearId"].as_str().expect("academicYearId").to_string();
    let class = request_ok(stdin, reader, "s3", "classes.create", json!({ "tenantId": "t1", "name": "Grade 5" }));
    let class_id = class["classId"].as_str().expect("classId").to_string();
    request_ok(
        stdin,
        reader,
        "s4",
        "sections.create",
        json!({ "tenantId": "t1", "classId": class_id, "name": "A" }),
    );

    let mut student_ids = Vec::new();
    if count > 0 {
        let mut csv = format!("{HEADER}\n");
        for i in 0..count {
            csv.push_str(&student_row(&format!("ADM{:04}", i), &format!("Kid{}", i)));
            csv.push('\n');
        }
        let path = workspace.join("seed.csv");
        std::fs::write(&path, csv).expect("write seed csv");
        let imported = request_ok(
            stdin,
            reader,
            "s5",
            "import.students",
            json!({
                "tenantId": "t1",
                "branchId": branch_id,
                "academicYearId": year_id,
                "inPath": path.to_string_lossy()
            }),
        );
        assert_eq!(imported["successCount"].as_u64(), Some(count as u64), "{}", imported);
        student_ids = imported["createdStudentIds"]
            .as_array()
            .expect("ids")
            .iter()
            .map(|v| v.as_str().expect("id").to_string())
            .collect();
    }
    (branch_id, year_id, student_ids)
}

#[test]
fn csv_export_follows_requested_column_order() {
    let workspace = temp_dir("rosterd-export-csv");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_, _, ids) = seed(&mut stdin, &mut reader, &workspace, 3);

    let op = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "bulk.export",
        json!({
            "tenantId": "t1",
            "studentIds": [ids[2], ids[0], "ghost-student"],
            "format": "csv",
            "columns": ["admission_number", "first_name", "favourite_colour", "class", "guardian_name"]
        }),
    );
    assert_eq!(op["type"], "export");
    assert_eq!(op["status"], "completed");
    assert_eq!(op["totalCount"], 3);
    assert_eq!(op["successCount"], 3);
    assert_eq!(op["failureCount"], 0);
    assert_eq!(op["parameters"]["rowCount"], 2);
    assert!(op["parameters"]["resultSha256"].as_str().map(|s| s.len()) == Some(64));

    let op_id = op["id"].as_str().expect("id");
    let result_ref = op["resultRef"].as_str().expect("resultRef");
    assert_eq!(result_ref, format!("exports/t1/{}.csv", op_id));

    let text = std::fs::read_to_string(workspace.join(result_ref)).expect("read export");
    assert_eq!(
        text,
        "Admission Number,First Name,favourite_colour,Class,Guardian Name\n\
         ADM0002,Kid2,,Grade 5,Ravi Rao\n\
         ADM0000,Kid0,,Grade 5,Ravi Rao\n"
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn export_format_falls_back_to_workspace_default() {
    let workspace = temp_dir("rosterd-export-xlsx");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_, _, ids) = seed(&mut stdin, &mut reader, &workspace, 2);

    let bad = request(
        &mut stdin,
        &mut reader,
        "1",
        "bulk.export",
        json!({ "tenantId": "t1", "studentIds": ids, "format": "pdf" }),
    );
    assert_eq!(error_code(&bad), Some("invalid_export_format"));
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "bulk.list",
        json!({ "tenantId": "t1", "type": "export" }),
    );
    assert_eq!(listed["operations"].as_array().map(|a| a.len()), Some(0));

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "section": "exports", "patch": { "defaultFormat": "excel", "outputDir": "out/reports" } }),
    );
    let op = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "bulk.export",
        json!({ "tenantId": "t1", "studentIds": ids }),
    );
    assert_eq!(op["status"], "completed");
    assert_eq!(op["parameters"]["format"], "xlsx");
    let result_ref = op["resultRef"].as_str().expect("resultRef");
    assert!(result_ref.starts_with("out/reports/t1/"));
    assert!(result_ref.ends_with(".xlsx"));
    let bytes = std::fs::read(workspace.join(result_ref)).expect("read export");
    assert_eq!(&bytes[..2], b"PK");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn export_column_catalogue() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let catalogue = request_ok(&mut stdin, &mut reader, "1", "bulk.exportColumns", json!({}));
    let columns = catalogue["columns"].as_array().expect("columns");
    assert_eq!(columns.len(), 23);
    assert_eq!(columns[0], json!({ "key": "admission_number", "label": "Admission Number" }));
    assert_eq!(columns[22]["key"], "postal_code");
    assert_eq!(catalogue["defaults"].as_array().map(|a| a.len()), Some(9));

    drop(stdin);
    let _ = child.wait();
}
