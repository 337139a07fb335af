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

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn courses_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let code = get_required_str(params, "code")?;
    let name = get_required_str(params, "name")?;
    if code.trim().is_empty() || name.trim().is_empty() {
        return Err(bad_params("code and name must be non-empty"));
    }

    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, code, name) VALUES(?, ?, ?)",
        (&id, &code, &name),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr {
                code: "conflict",
                message: format!("course code '{}' already exists", code),
                details: None,
            }
        } else {
            HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: None,
            }
        }
    })?;
    Ok(json!({ "courseId": id }))
}

fn courses_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, code, name FROM courses ORDER BY code")
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let courses: Vec<serde_json::Value> = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(json!({ "courses": courses }))
}

fn courses_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(bad_params("missing patch"));
    };

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
            details: None,
        });
    }

    if let Some(v) = patch.get("code").and_then(|v| v.as_str()) {
        conn
            .execute("UPDATE courses SET code = ? WHERE id = ?", (v, &course_id))
            .map_err(|e| {
                if is_unique_violation(&e) {
                    HandlerErr {
                        code: "conflict",
                        message: format!("course code '{}' already exists", v),
                        details: None,
                    }
                } else {
                    HandlerErr {
                        code: "db_update_failed",
                        message: e.to_string(),
                        details: None,
                    }
                }
            })?;
    }
    if let Some(v) = patch.get("name").and_then(|v| v.as_str()) {
        conn.execute("UPDATE courses SET name = ? WHERE id = ?", (v, &course_id))
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: None,
            })?;
    }
    Ok(json!({ "ok": true }))
}

fn courses_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let referenced: i64 = conn
        .query_row(
            "SELECT (SELECT COUNT(*) FROM grade_records WHERE course_id = ?1)
                  + (SELECT COUNT(*) FROM attendance_days WHERE course_id = ?1)",
            [&course_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if referenced > 0 {
        return Err(HandlerErr {
            code: "conflict",
            message: "course has grade or attendance records".to_string(),
            details: Some(json!({ "references": referenced })),
        });
    }
    let deleted = conn
        .execute("DELETE FROM courses WHERE id = ?", [&course_id])
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    if deleted == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
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
        "courses.create" => Some(with_db(state, req, |c, p| courses_create(c, p))),
        "courses.list" => Some(with_db(state, req, |c, _| courses_list(c))),
        "courses.update" => Some(with_db(state, req, |c, p| courses_update(c, p))),
        "courses.delete" => Some(with_db(state, req, |c, p| courses_delete(c, p))),
        _ => None,
    }
}
