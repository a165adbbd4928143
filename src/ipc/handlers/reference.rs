use crate::bulk::model::normalize_student_status;
use crate::bulk::resolver::ReferenceData;
use crate::ipc::error::ok;
use crate::ipc::helpers::{get_opt_bool, get_opt_str, get_opt_usize, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

const STUDENTS_LIST_MAX: usize = 1000;

fn insert_failed(table: &str, e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": table })),
    }
}

fn branches_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let name = get_required_str(params, "name")?;
    let branch_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO branches(id, tenant_id, name) VALUES(?, ?, ?)",
        (&branch_id, &tenant_id, &name),
    )
    .map_err(|e| insert_failed("branches", e))?;
    Ok(json!({ "branchId": branch_id, "name": name }))
}

fn academic_years_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let name = get_required_str(params, "name")?;
    let start_date = get_opt_str(params, "startDate")?;
    let end_date = get_opt_str(params, "endDate")?;
    let is_current = get_opt_bool(params, "isCurrent")?.unwrap_or(false);

    let year_id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    if is_current {
        tx.execute(
            "UPDATE academic_years SET is_current = 0 WHERE tenant_id = ?",
            [&tenant_id],
        )?;
    }
    tx.execute(
        "INSERT INTO academic_years(id, tenant_id, name, start_date, end_date, is_current)
         VALUES(?, ?, ?, ?, ?, ?)",
        params![&year_id, &tenant_id, &name, &start_date, &end_date, is_current as i64],
    )
    .map_err(|e| insert_failed("academic_years", e))?;
    tx.commit()?;
    Ok(json!({ "academicYearId": year_id, "name": name, "isCurrent": is_current }))
}

fn classes_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let name = get_required_str(params, "name")?;
    let sort_order = match params.get("sortOrder") {
        None | Some(Value::Null) => {
            conn.query_row(
                "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM classes WHERE tenant_id = ?",
                [&tenant_id],
                |r| r.get::<_, i64>(0),
            )?
        }
        Some(v) => v
            .as_i64()
            .ok_or_else(|| HandlerErr::bad_params("sortOrder must be an integer"))?,
    };
    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, tenant_id, name, sort_order) VALUES(?, ?, ?, ?)",
        params![&class_id, &tenant_id, &name, sort_order],
    )
    .map_err(|e| insert_failed("classes", e))?;
    Ok(json!({ "classId": class_id, "name": name, "sortOrder": sort_order }))
}

fn sections_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let class_id = get_required_str(params, "classId")?;
    let name = get_required_str(params, "name")?;

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM classes WHERE id = ? AND tenant_id = ?",
            [&class_id, &tenant_id],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("class not found: {}", class_id),
            details: Some(json!({ "entity": "class", "id": class_id })),
        });
    }

    let section_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sections(id, tenant_id, class_id, name) VALUES(?, ?, ?, ?)",
        (&section_id, &tenant_id, &class_id, &name),
    )
    .map_err(|e| insert_failed("sections", e))?;
    Ok(json!({ "sectionId": section_id, "classId": class_id, "name": name }))
}

fn reference_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;

    let mut stmt = conn.prepare("SELECT id, name FROM branches WHERE tenant_id = ? ORDER BY name")?;
    let branches = stmt
        .query_map([&tenant_id], |r| {
            Ok(json!({ "id": r.get::<_, String>(0)?, "name": r.get::<_, String>(1)? }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, name, start_date, end_date, is_current FROM academic_years
         WHERE tenant_id = ? ORDER BY name",
    )?;
    let years = stmt
        .query_map([&tenant_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, Option<String>>(2)?,
                "endDate": r.get::<_, Option<String>>(3)?,
                "isCurrent": r.get::<_, i64>(4)? != 0
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let refs = ReferenceData::load(conn, &tenant_id)?;
    let classes: Vec<Value> = refs
        .classes()
        .iter()
        .map(|c| json!({ "id": c.id, "name": c.name, "sections": c.sections }))
        .collect();

    Ok(json!({ "branches": branches, "academicYears": years, "classes": classes }))
}

fn students_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let status = match get_opt_str(params, "status")? {
        None => None,
        Some(raw) => Some(
            normalize_student_status(&raw)
                .ok_or_else(|| HandlerErr::new("invalid_status", format!("unknown student status: {}", raw)))?,
        ),
    };
    let limit = get_opt_usize(params, "limit")?
        .unwrap_or(STUDENTS_LIST_MAX)
        .clamp(1, STUDENTS_LIST_MAX);

    let mut stmt = conn.prepare(
        "SELECT id, admission_number, first_name, last_name, status
         FROM students
         WHERE tenant_id = ?1 AND (?2 IS NULL OR status = ?2)
         ORDER BY admission_number
         LIMIT ?3",
    )?;
    let students = stmt
        .query_map(params![&tenant_id, status, limit as i64], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "admissionNumber": r.get::<_, String>(1)?,
                "firstName": r.get::<_, String>(2)?,
                "lastName": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

fn students_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let tenant_id = get_required_str(params, "tenantId")?;
    let student_id = get_required_str(params, "studentId")?;

    let student = conn
        .query_row(
            "SELECT id, branch_id, admission_number, first_name, last_name, date_of_birth, gender,
                    email, phone, blood_group, admission_date, status, created_by, created_at, updated_at
             FROM students WHERE id = ? AND tenant_id = ?",
            [&student_id, &tenant_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "branchId": r.get::<_, Option<String>>(1)?,
                    "admissionNumber": r.get::<_, String>(2)?,
                    "firstName": r.get::<_, String>(3)?,
                    "lastName": r.get::<_, String>(4)?,
                    "dateOfBirth": r.get::<_, Option<String>>(5)?,
                    "gender": r.get::<_, Option<String>>(6)?,
                    "email": r.get::<_, Option<String>>(7)?,
                    "phone": r.get::<_, Option<String>>(8)?,
                    "bloodGroup": r.get::<_, Option<String>>(9)?,
                    "admissionDate": r.get::<_, Option<String>>(10)?,
                    "status": r.get::<_, String>(11)?,
                    "createdBy": r.get::<_, Option<String>>(12)?,
                    "createdAt": r.get::<_, String>(13)?,
                    "updatedAt": r.get::<_, Option<String>>(14)?
                }))
            },
        )
        .optional()?;
    let Some(mut student) = student else {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("student not found: {}", student_id),
            details: Some(json!({ "entity": "student", "id": student_id })),
        });
    };

    let mut stmt = conn.prepare(
        "SELECT id, first_name, last_name, relation, phone, email, is_primary
         FROM guardians WHERE student_id = ? ORDER BY is_primary DESC, rowid",
    )?;
    let guardians = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "firstName": r.get::<_, String>(1)?,
                "lastName": r.get::<_, String>(2)?,
                "relation": r.get::<_, Option<String>>(3)?,
                "phone": r.get::<_, Option<String>>(4)?,
                "email": r.get::<_, Option<String>>(5)?,
                "isPrimary": r.get::<_, i64>(6)? != 0
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, address_type, line1, line2, city, state, postal_code, country
         FROM student_addresses WHERE student_id = ? ORDER BY rowid",
    )?;
    let addresses = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "addressType": r.get::<_, String>(1)?,
                "line1": r.get::<_, Option<String>>(2)?,
                "line2": r.get::<_, Option<String>>(3)?,
                "city": r.get::<_, Option<String>>(4)?,
                "state": r.get::<_, Option<String>>(5)?,
                "postalCode": r.get::<_, Option<String>>(6)?,
                "country": r.get::<_, Option<String>>(7)?
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT e.id, e.academic_year_id, e.class_id, c.name, e.section_id, s.name, e.roll_number, e.status, e.enrolled_at
         FROM enrollments e
         LEFT JOIN classes c ON c.id = e.class_id
         LEFT JOIN sections s ON s.id = e.section_id
         WHERE e.student_id = ? ORDER BY e.enrolled_at DESC, e.rowid DESC",
    )?;
    let enrollments = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "academicYearId": r.get::<_, String>(1)?,
                "classId": r.get::<_, String>(2)?,
                "className": r.get::<_, Option<String>>(3)?,
                "sectionId": r.get::<_, Option<String>>(4)?,
                "sectionName": r.get::<_, Option<String>>(5)?,
                "rollNumber": r.get::<_, Option<String>>(6)?,
                "status": r.get::<_, String>(7)?,
                "enrolledAt": r.get::<_, String>(8)?
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    student["guardians"] = Value::Array(guardians);
    student["addresses"] = Value::Array(addresses);
    student["enrollments"] = Value::Array(enrollments);
    Ok(student)
}

fn with_db(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &Value) -> Result<Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };
    match f(conn, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "branches.create" => branches_create,
        "academicYears.create" => academic_years_create,
        "classes.create" => classes_create,
        "sections.create" => sections_create,
        "reference.list" => reference_list,
        "students.list" => students_list,
        "students.get" => students_get,
        _ => return None,
    };
    Some(with_db(state, req, f))
}
