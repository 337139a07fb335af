use crate::calc::{self, AttendanceStatus, AttendanceTally};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
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

fn not_found(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "not_found",
        message: message.into(),
        details: None,
    }
}

fn record_locked() -> HandlerErr {
    HandlerErr {
        code: "record_locked",
        message: "attendance day is locked; unlock it first".to_string(),
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

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

fn parse_day_date(raw: &str) -> Result<String, HandlerErr> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| bad_params("date must be YYYY-MM-DD"))?;
    Ok(date.format("%Y-%m-%d").to_string())
}

fn parse_status(raw: &str) -> Result<AttendanceStatus, HandlerErr> {
    AttendanceStatus::parse(raw)
        .ok_or_else(|| bad_params(format!("unknown attendance status '{}'", raw)))
}

struct DayRow {
    id: String,
    course_id: String,
    date: String,
    tally: AttendanceTally,
    percentage: f64,
    locked: bool,
    locked_by: Option<String>,
    locked_at: Option<String>,
}

fn load_day(conn: &Connection, day_id: &str) -> Result<DayRow, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, course_id, date,
                    present_count, absent_count, late_count, excused_count, suspended_count,
                    percentage, locked, locked_by, locked_at
             FROM attendance_days
             WHERE id = ?",
            [day_id],
            |r| {
                Ok(DayRow {
                    id: r.get(0)?,
                    course_id: r.get(1)?,
                    date: r.get(2)?,
                    tally: AttendanceTally {
                        present_count: r.get(3)?,
                        absent_count: r.get(4)?,
                        late_count: r.get(5)?,
                        excused_count: r.get(6)?,
                        suspended_count: r.get(7)?,
                    },
                    percentage: r.get(8)?,
                    locked: r.get::<_, i64>(9)? != 0,
                    locked_by: r.get(10)?,
                    locked_at: r.get(11)?,
                })
            },
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    row.ok_or_else(|| not_found("attendance day not found"))
}

/// Re-derive counts and percentage from the day's entries and store them on
/// the day row. Runs inside the caller's transaction so entries and derived
/// fields always land together.
fn retally_day(conn: &Connection, day_id: &str) -> Result<(AttendanceTally, f64), HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT status FROM attendance_entries WHERE day_id = ?")
        .map_err(|e| db_err("db_query_failed", e))?;
    let statuses: Vec<String> = stmt
        .query_map([day_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    let mut parsed = Vec::with_capacity(statuses.len());
    for s in &statuses {
        parsed.push(parse_status(s)?);
    }
    let tally = calc::tally(parsed);
    let percentage = calc::attendance_percentage(&tally);

    conn.execute(
        "UPDATE attendance_days SET
            present_count = ?, absent_count = ?, late_count = ?,
            excused_count = ?, suspended_count = ?, percentage = ?
         WHERE id = ?",
        rusqlite::params![
            tally.present_count,
            tally.absent_count,
            tally.late_count,
            tally.excused_count,
            tally.suspended_count,
            percentage,
            day_id,
        ],
    )
    .map_err(|e| db_err("db_update_failed", e))?;
    Ok((tally, percentage))
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| db_err("db_query_failed", e))
}

fn day_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let date = parse_day_date(&get_required_str(params, "date")?)?;

    let course_exists = conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?
        .is_some();
    if !course_exists {
        return Err(not_found("course not found"));
    }

    let entries: Vec<(String, AttendanceStatus)> = match params.get("entries") {
        None => Vec::new(),
        Some(v) => {
            let Some(arr) = v.as_array() else {
                return Err(bad_params("entries must be an array"));
            };
            let mut out = Vec::with_capacity(arr.len());
            for e in arr {
                let student_id = get_required_str(e, "studentId")?;
                let status = parse_status(&get_required_str(e, "status")?)?;
                out.push((student_id, status));
            }
            out
        }
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    let id = uuid::Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO attendance_days(id, course_id, date) VALUES(?, ?, ?)",
        (&id, &course_id, &date),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr {
                code: "conflict",
                message: format!("attendance day already exists for {} on {}", course_id, date),
                details: None,
            }
        } else {
            db_err("db_update_failed", e)
        }
    })?;
    for (student_id, status) in &entries {
        if !student_exists(&tx, student_id)? {
            return Err(not_found(format!("student {} not found", student_id)));
        }
        tx.execute(
            "INSERT INTO attendance_entries(day_id, student_id, status) VALUES(?, ?, ?)
             ON CONFLICT(day_id, student_id) DO UPDATE SET status = excluded.status",
            (&id, student_id, status.as_str()),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
    }
    let (tally, percentage) = retally_day(&tx, &id)?;
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    Ok(json!({ "dayId": id, "tally": tally, "percentage": percentage }))
}

fn day_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let day_id = get_required_str(params, "dayId")?;
    let day = load_day(conn, &day_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT student_id, status FROM attendance_entries
             WHERE day_id = ?
             ORDER BY student_id",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let entries: Vec<serde_json::Value> = stmt
        .query_map([&day_id], |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "status": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    Ok(json!({
        "dayId": day.id,
        "courseId": day.course_id,
        "date": day.date,
        "entries": entries,
        "tally": day.tally,
        "percentage": day.percentage,
        "locked": day.locked,
        "lockedBy": day.locked_by,
        "lockedAt": day.locked_at,
    }))
}

fn list_for_course(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, date, present_count, absent_count, late_count,
                    excused_count, suspended_count, percentage, locked
             FROM attendance_days
             WHERE course_id = ?
             ORDER BY date",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let days: Vec<serde_json::Value> = stmt
        .query_map([&course_id], |r| {
            Ok(json!({
                "dayId": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "tally": {
                    "presentCount": r.get::<_, i64>(2)?,
                    "absentCount": r.get::<_, i64>(3)?,
                    "lateCount": r.get::<_, i64>(4)?,
                    "excusedCount": r.get::<_, i64>(5)?,
                    "suspendedCount": r.get::<_, i64>(6)?,
                },
                "percentage": r.get::<_, f64>(7)?,
                "locked": r.get::<_, i64>(8)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({ "days": days }))
}

fn set_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let day_id = get_required_str(params, "dayId")?;
    let student_id = get_required_str(params, "studentId")?;
    let status = match params.get("status") {
        None => return Err(bad_params("missing status")),
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(bad_params("status must be string or null"));
            };
            Some(parse_status(s)?)
        }
    };

    let day = load_day(conn, &day_id)?;
    if day.locked {
        return Err(record_locked());
    }
    if !student_exists(conn, &student_id)? {
        return Err(not_found("student not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    match status {
        Some(status) => {
            tx.execute(
                "INSERT INTO attendance_entries(day_id, student_id, status) VALUES(?, ?, ?)
                 ON CONFLICT(day_id, student_id) DO UPDATE SET status = excluded.status",
                (&day_id, &student_id, status.as_str()),
            )
            .map_err(|e| db_err("db_update_failed", e))?;
        }
        None => {
            tx.execute(
                "DELETE FROM attendance_entries WHERE day_id = ? AND student_id = ?",
                (&day_id, &student_id),
            )
            .map_err(|e| db_err("db_update_failed", e))?;
        }
    }
    let (tally, percentage) = retally_day(&tx, &day_id)?;
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    Ok(json!({ "dayId": day_id, "tally": tally, "percentage": percentage }))
}

fn bulk_set_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let day_id = get_required_str(params, "dayId")?;
    let Some(arr) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(bad_params("missing entries"));
    };
    let mut entries = Vec::with_capacity(arr.len());
    for e in arr {
        let student_id = get_required_str(e, "studentId")?;
        let status = parse_status(&get_required_str(e, "status")?)?;
        entries.push((student_id, status));
    }

    let day = load_day(conn, &day_id)?;
    if day.locked {
        return Err(record_locked());
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    for (student_id, status) in &entries {
        if !student_exists(&tx, student_id)? {
            return Err(not_found(format!("student {} not found", student_id)));
        }
        tx.execute(
            "INSERT INTO attendance_entries(day_id, student_id, status) VALUES(?, ?, ?)
             ON CONFLICT(day_id, student_id) DO UPDATE SET status = excluded.status",
            (&day_id, student_id, status.as_str()),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
    }
    let (tally, percentage) = retally_day(&tx, &day_id)?;
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    Ok(json!({ "dayId": day_id, "tally": tally, "percentage": percentage }))
}

fn lock_day(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let day_id = get_required_str(params, "dayId")?;
    let locked_by = get_required_str(params, "lockedBy")?;
    let day = load_day(conn, &day_id)?;
    if day.locked {
        return Err(HandlerErr {
            code: "conflict",
            message: "attendance day is already locked".to_string(),
            details: Some(json!({ "lockedBy": day.locked_by, "lockedAt": day.locked_at })),
        });
    }
    let locked_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE attendance_days SET locked = 1, locked_by = ?, locked_at = ? WHERE id = ?",
        (&locked_by, &locked_at, &day_id),
    )
    .map_err(|e| db_err("db_update_failed", e))?;
    Ok(json!({ "dayId": day_id, "locked": true, "lockedBy": locked_by, "lockedAt": locked_at }))
}

fn unlock_day(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let day_id = get_required_str(params, "dayId")?;
    let day = load_day(conn, &day_id)?;
    if !day.locked {
        return Err(HandlerErr {
            code: "conflict",
            message: "attendance day is not locked".to_string(),
            details: None,
        });
    }
    conn.execute(
        "UPDATE attendance_days SET locked = 0, locked_by = NULL, locked_at = NULL WHERE id = ?",
        [&day_id],
    )
    .map_err(|e| db_err("db_update_failed", e))?;
    Ok(json!({ "dayId": day_id, "locked": false }))
}

fn day_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let day_id = get_required_str(params, "dayId")?;
    let day = load_day(conn, &day_id)?;
    if day.locked {
        return Err(record_locked());
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    tx.execute("DELETE FROM attendance_entries WHERE day_id = ?", [&day_id])
        .map_err(|e| db_err("db_update_failed", e))?;
    tx.execute("DELETE FROM attendance_days WHERE id = ?", [&day_id])
        .map_err(|e| db_err("db_update_failed", e))?;
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;
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
        "attendance.dayCreate" => Some(with_db(state, req, |c, p| day_create(c, p))),
        "attendance.dayOpen" => Some(with_db(state, req, |c, p| day_open(c, p))),
        "attendance.listForCourse" => Some(with_db(state, req, |c, p| list_for_course(c, p))),
        "attendance.setStatus" => Some(with_db(state, req, |c, p| set_status(c, p))),
        "attendance.bulkSetStatus" => Some(with_db(state, req, |c, p| bulk_set_status(c, p))),
        "attendance.lock" => Some(with_db(state, req, |c, p| lock_day(c, p))),
        "attendance.unlock" => Some(with_db(state, req, |c, p| unlock_day(c, p))),
        "attendance.dayDelete" => Some(with_db(state, req, |c, p| day_delete(c, p))),
        _ => None,
    }
}
