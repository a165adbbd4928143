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

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("rosterd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let before = request(&mut stdin, &mut reader, "0", "bulk.list", json!({ "tenantId": "t1" }));
    assert_eq!(error_code(&before), Some("no_workspace"));

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health["result"]["version"].is_string());
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let setup = request(&mut stdin, &mut reader, "3", "setup.get", json!({}));
    assert_eq!(setup["result"]["exports"]["defaultFormat"], "csv");
    assert_eq!(setup["result"]["imports"]["maxRows"], 500);

    let branch = request(
        &mut stdin,
        &mut reader,
        "4",
        "branches.create",
        json!({ "tenantId": "t1", "name": "Main" }),
    );
    assert!(branch["result"]["branchId"].is_string());
    let _ = request(
        &mut stdin,
        &mut reader,
        "5",
        "academicYears.create",
        json!({ "tenantId": "t1", "name": "2026-27", "isCurrent": true }),
    );
    let class = request(
        &mut stdin,
        &mut reader,
        "6",
        "classes.create",
        json!({ "tenantId": "t1", "name": "Grade 1" }),
    );
    let class_id = class["result"]["classId"].as_str().expect("classId").to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "sections.create",
        json!({ "tenantId": "t1", "classId": class_id, "name": "A" }),
    );
    let refs = request(&mut stdin, &mut reader, "8", "reference.list", json!({ "tenantId": "t1" }));
    assert_eq!(refs["result"]["classes"][0]["sections"], json!(["A"]));

    let _ = request(&mut stdin, &mut reader, "9", "students.list", json!({ "tenantId": "t1" }));
    let missing = request(
        &mut stdin,
        &mut reader,
        "10",
        "students.get",
        json!({ "tenantId": "t1", "studentId": "nope" }),
    );
    assert_eq!(error_code(&missing), Some("not_found"));

    let _ = request(&mut stdin, &mut reader, "11", "bulk.exportColumns", json!({}));
    let created = request(
        &mut stdin,
        &mut reader,
        "12",
        "bulk.create",
        json!({ "tenantId": "t1", "type": "email", "studentIds": ["s1"] }),
    );
    let op_id = created["result"]["id"].as_str().expect("operation id").to_string();
    let processed = request(
        &mut stdin,
        &mut reader,
        "13",
        "bulk.process",
        json!({ "tenantId": "t1", "operationId": op_id }),
    );
    assert_eq!(error_code(&processed), Some("invalid_operation_type"));
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "bulk.get",
        json!({ "tenantId": "t1", "operationId": op_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "bulk.cancel",
        json!({ "tenantId": "t1", "operationId": op_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "import.template",
        json!({ "tenantId": "t1" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "import.students",
        json!({
            "tenantId": "t1",
            "branchId": "missing",
            "academicYearId": "missing",
            "inPath": "nothing.csv"
        }),
    );

    let unknown = {
        writeln!(stdin, "{}", json!({ "id": "18", "method": "grades.open", "params": {} }))
            .expect("write");
        stdin.flush().expect("flush");
        let mut line = String::new();
        reader.read_line(&mut line).expect("read");
        serde_json::from_str::<serde_json::Value>(line.trim()).expect("json")
    };
    assert_eq!(error_code(&unknown), Some("not_implemented"));

    writeln!(stdin, "not json").expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let bad: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(error_code(&bad), Some("bad_json"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
