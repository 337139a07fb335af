use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details: None,
    }
}

fn db_err(code: &'static str, e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code,
        message: e.to_string(),
        details: None,
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn student_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "lastName": r.get::<_, String>(1)?,
        "firstName": r.get::<_, String>(2)?,
        "studentNo": r.get::<_, Option<String>>(3)?,
        "active": r.get::<_, i64>(4)? != 0,
    }))
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let last_name = get_required_str(params, "lastName")?;
    let first_name = get_required_str(params, "firstName")?;
    let student_no = params
        .get("studentNo")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let active = params.get("active").and_then(|v| v.as_bool()).unwrap_or(true);
    if last_name.trim().is_empty() || first_name.trim().is_empty() {
        return Err(bad_params("lastName and firstName must be non-empty"));
    }

    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, last_name, first_name, student_no, active, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            &last_name,
            &first_name,
            &student_no,
            active as i64,
            now_rfc3339(),
        ),
    )
    .map_err(|e| db_err("db_update_failed", e))?;
    Ok(json!({ "studentId": id }))
}

fn students_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, student_no, active
             FROM students
             ORDER BY last_name, first_name",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let students: Vec<serde_json::Value> = stmt
        .query_map([], |r| student_row_json(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({ "students": students }))
}

fn students_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(bad_params("missing patch"));
    };

    let exists = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?
        .is_some();
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    if let Some(v) = patch.get("lastName").and_then(|v| v.as_str()) {
        conn.execute(
            "UPDATE students SET last_name = ?, updated_at = ? WHERE id = ?",
            (v, now_rfc3339(), &student_id),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
    }
    if let Some(v) = patch.get("firstName").and_then(|v| v.as_str()) {
        conn.execute(
            "UPDATE students SET first_name = ?, updated_at = ? WHERE id = ?",
            (v, now_rfc3339(), &student_id),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
    }
    if let Some(v) = patch.get("studentNo").and_then(|v| v.as_str()) {
        conn.execute(
            "UPDATE students SET student_no = ?, updated_at = ? WHERE id = ?",
            (v, now_rfc3339(), &student_id),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
    }
    if let Some(v) = patch.get("active").and_then(|v| v.as_bool()) {
        conn.execute(
            "UPDATE students SET active = ?, updated_at = ? WHERE id = ?",
            (v as i64, now_rfc3339(), &student_id),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
    }

    Ok(json!({ "ok": true }))
}

fn students_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let referenced: i64 = conn
        .query_row(
            "SELECT (SELECT COUNT(*) FROM grade_records WHERE student_id = ?1)
                  + (SELECT COUNT(*) FROM attendance_entries WHERE student_id = ?1)",
            [&student_id],
            |r| r.get(0),
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    if referenced > 0 {
        return Err(HandlerErr {
            code: "conflict",
            message: "student has grade or attendance records".to_string(),
            details: Some(json!({ "references": referenced })),
        });
    }
    let deleted = conn
        .execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| db_err("db_update_failed", e))?;
    if deleted == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }
    Ok(json!({ "ok": true }))
}

fn with_db(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(with_db(state, req, |c, p| students_create(c, p))),
        "students.list" => Some(with_db(state, req, |c, _| students_list(c))),
        "students.update" => Some(with_db(state, req, |c, p| students_update(c, p))),
        "students.delete" => Some(with_db(state, req, |c, p| students_delete(c, p))),
        _ => None,
    }
}
