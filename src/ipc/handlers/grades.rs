use crate::calc::{self, FixedComponent, GradeComponents, ScoreComponent};
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

fn not_found(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "not_found",
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

fn calc_err(e: calc::CalcError) -> HandlerErr {
    HandlerErr {
        code: "validation_failed",
        message: e.message,
        details: e.details,
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

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

struct GradeRow {
    id: String,
    student_id: String,
    course_id: String,
    academic_year: String,
    semester: i64,
    components: GradeComponents,
    attendance_percent: f64,
    percentage: f64,
    letter_grade: String,
    gpa: f64,
    is_published: bool,
}

fn parse_components_column(raw: &str, what: &str) -> Result<Vec<ScoreComponent>, HandlerErr> {
    serde_json::from_str(raw).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: format!("stored {} column is not valid JSON: {}", what, e),
        details: None,
    })
}

fn load_grade(conn: &Connection, grade_id: &str) -> Result<GradeRow, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, student_id, course_id, academic_year, semester,
                    assignments, quizzes,
                    midterm_max, midterm_score,
                    final_max, final_score,
                    participation_max, participation_score,
                    attendance_percent, percentage, letter_grade, gpa, is_published
             FROM grade_records
             WHERE id = ?",
            [grade_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, f64>(7)?,
                    r.get::<_, Option<f64>>(8)?,
                    r.get::<_, f64>(9)?,
                    r.get::<_, Option<f64>>(10)?,
                    r.get::<_, f64>(11)?,
                    r.get::<_, Option<f64>>(12)?,
                    r.get::<_, f64>(13)?,
                    r.get::<_, f64>(14)?,
                    r.get::<_, String>(15)?,
                    r.get::<_, f64>(16)?,
                    r.get::<_, i64>(17)? != 0,
                ))
            },
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    let Some((
        id,
        student_id,
        course_id,
        academic_year,
        semester,
        assignments_raw,
        quizzes_raw,
        midterm_max,
        midterm_score,
        final_max,
        final_score,
        participation_max,
        participation_score,
        attendance_percent,
        percentage,
        letter_grade,
        gpa,
        is_published,
    )) = row
    else {
        return Err(not_found("grade record not found"));
    };

    Ok(GradeRow {
        id,
        student_id,
        course_id,
        academic_year,
        semester,
        components: GradeComponents {
            assignments: parse_components_column(&assignments_raw, "assignments")?,
            quizzes: parse_components_column(&quizzes_raw, "quizzes")?,
            midterm: FixedComponent {
                max_score: midterm_max,
                score: midterm_score,
            },
            final_exam: FixedComponent {
                max_score: final_max,
                score: final_score,
            },
            participation: FixedComponent {
                max_score: participation_max,
                score: participation_score,
            },
        },
        attendance_percent,
        percentage,
        letter_grade,
        gpa,
        is_published,
    })
}

fn grade_row_json(row: &GradeRow) -> serde_json::Value {
    json!({
        "gradeId": row.id,
        "studentId": row.student_id,
        "courseId": row.course_id,
        "academicYear": row.academic_year,
        "semester": row.semester,
        "assignments": row.components.assignments,
        "quizzes": row.components.quizzes,
        "midterm": row.components.midterm,
        "finalExam": row.components.final_exam,
        "participation": row.components.participation,
        "attendancePercent": row.attendance_percent,
        "finalGrade": {
            "percentage": row.percentage,
            "letterGrade": row.letter_grade,
            "gpa": row.gpa,
        },
        "isPublished": row.is_published,
    })
}

fn grades_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let course_id = get_required_str(params, "courseId")?;
    let academic_year = get_required_str(params, "academicYear")?;
    let semester = params
        .get("semester")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| bad_params("missing semester"))?;

    let student_exists = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?
        .is_some();
    if !student_exists {
        return Err(not_found("student not found"));
    }
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

    // A fresh record carries no graded categories: 0 / F / 0.0.
    let final_grade = calc::recompute(&GradeComponents::default()).map_err(calc_err)?;

    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grade_records(
            id, student_id, course_id, academic_year, semester,
            percentage, letter_grade, gpa, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &student_id,
            &course_id,
            &academic_year,
            semester,
            final_grade.percentage,
            final_grade.letter_grade.as_str(),
            final_grade.gpa,
            now_rfc3339(),
        ),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr {
                code: "conflict",
                message: "grade record already exists for this student/course/year/semester"
                    .to_string(),
                details: None,
            }
        } else {
            db_err("db_update_failed", e)
        }
    })?;
    Ok(json!({ "gradeId": id }))
}

fn grades_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let grade_id = get_required_str(params, "gradeId")?;
    let row = load_grade(conn, &grade_id)?;
    Ok(grade_row_json(&row))
}

fn grades_list_for_course(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let academic_year = params
        .get("academicYear")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let semester = params.get("semester").and_then(|v| v.as_i64());

    let mut stmt = conn
        .prepare(
            "SELECT id FROM grade_records
             WHERE course_id = ?1
               AND (?2 IS NULL OR academic_year = ?2)
               AND (?3 IS NULL OR semester = ?3)
             ORDER BY academic_year, semester, student_id",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let ids: Vec<String> = stmt
        .query_map((&course_id, &academic_year, &semester), |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    let mut grades = Vec::with_capacity(ids.len());
    for id in ids {
        grades.push(grade_row_json(&load_grade(conn, &id)?));
    }
    Ok(json!({ "grades": grades }))
}

fn parse_score_components(
    v: &serde_json::Value,
    what: &str,
) -> Result<Vec<ScoreComponent>, HandlerErr> {
    serde_json::from_value(v.clone())
        .map_err(|e| bad_params(format!("{} must be a list of score components: {}", what, e)))
}

fn parse_fixed_component(v: &serde_json::Value, what: &str) -> Result<FixedComponent, HandlerErr> {
    serde_json::from_value(v.clone())
        .map_err(|e| bad_params(format!("{} must be a fixed component: {}", what, e)))
}

/// The single grade write boundary: apply the patch, re-derive the final
/// grade, and persist components + derived fields in one transaction.
fn grades_update_components(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let grade_id = get_required_str(params, "gradeId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(bad_params("missing patch"));
    };

    let mut row = load_grade(conn, &grade_id)?;
    if row.is_published {
        return Err(HandlerErr {
            code: "record_published",
            message: "grade record is published; components are immutable".to_string(),
            details: None,
        });
    }

    if let Some(v) = patch.get("assignments") {
        row.components.assignments = parse_score_components(v, "assignments")?;
    }
    if let Some(v) = patch.get("quizzes") {
        row.components.quizzes = parse_score_components(v, "quizzes")?;
    }
    if let Some(v) = patch.get("midterm") {
        row.components.midterm = parse_fixed_component(v, "midterm")?;
    }
    if let Some(v) = patch.get("finalExam") {
        row.components.final_exam = parse_fixed_component(v, "finalExam")?;
    }
    if let Some(v) = patch.get("participation") {
        row.components.participation = parse_fixed_component(v, "participation")?;
    }
    if let Some(v) = patch.get("attendancePercent") {
        let pct = v
            .as_f64()
            .ok_or_else(|| bad_params("attendancePercent must be a number"))?;
        if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
            return Err(HandlerErr {
                code: "validation_failed",
                message: "attendancePercent must be between 0 and 100".to_string(),
                details: None,
            });
        }
        row.attendance_percent = pct;
    }

    // Validation failures reject the whole write; nothing is persisted.
    let final_grade = calc::recompute(&row.components).map_err(calc_err)?;

    let assignments_json = serde_json::to_string(&row.components.assignments)
        .map_err(|e| bad_params(format!("assignments not serializable: {}", e)))?;
    let quizzes_json = serde_json::to_string(&row.components.quizzes)
        .map_err(|e| bad_params(format!("quizzes not serializable: {}", e)))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    tx.execute(
        "UPDATE grade_records SET
            assignments = ?, quizzes = ?,
            midterm_max = ?, midterm_score = ?,
            final_max = ?, final_score = ?,
            participation_max = ?, participation_score = ?,
            attendance_percent = ?,
            percentage = ?, letter_grade = ?, gpa = ?,
            updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            assignments_json,
            quizzes_json,
            row.components.midterm.max_score,
            row.components.midterm.score,
            row.components.final_exam.max_score,
            row.components.final_exam.score,
            row.components.participation.max_score,
            row.components.participation.score,
            row.attendance_percent,
            final_grade.percentage,
            final_grade.letter_grade.as_str(),
            final_grade.gpa,
            now_rfc3339(),
            grade_id,
        ],
    )
    .map_err(|e| db_err("db_update_failed", e))?;
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    Ok(json!({
        "gradeId": grade_id,
        "finalGrade": {
            "percentage": final_grade.percentage,
            "letterGrade": final_grade.letter_grade.as_str(),
            "gpa": final_grade.gpa,
        }
    }))
}

fn grades_set_published(
    conn: &Connection,
    params: &serde_json::Value,
    published: bool,
) -> Result<serde_json::Value, HandlerErr> {
    let grade_id = get_required_str(params, "gradeId")?;
    let updated = conn
        .execute(
            "UPDATE grade_records SET is_published = ?, updated_at = ? WHERE id = ?",
            (published as i64, now_rfc3339(), &grade_id),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
    if updated == 0 {
        return Err(not_found("grade record not found"));
    }
    Ok(json!({ "gradeId": grade_id, "isPublished": published }))
}

fn grades_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let grade_id = get_required_str(params, "gradeId")?;
    let row = load_grade(conn, &grade_id)?;
    if row.is_published {
        return Err(HandlerErr {
            code: "record_published",
            message: "unpublish the grade record before deleting it".to_string(),
            details: None,
        });
    }
    conn.execute("DELETE FROM grade_records WHERE id = ?", [&grade_id])
        .map_err(|e| db_err("db_update_failed", e))?;
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
        "grades.create" => Some(with_db(state, req, |c, p| grades_create(c, p))),
        "grades.open" => Some(with_db(state, req, |c, p| grades_open(c, p))),
        "grades.listForCourse" => Some(with_db(state, req, |c, p| grades_list_for_course(c, p))),
        "grades.updateComponents" => {
            Some(with_db(state, req, |c, p| grades_update_components(c, p)))
        }
        "grades.publish" => Some(with_db(state, req, |c, p| grades_set_published(c, p, true))),
        "grades.unpublish" => Some(with_db(state, req, |c, p| {
            grades_set_published(c, p, false)
        })),
        "grades.delete" => Some(with_db(state, req, |c, p| grades_delete(c, p))),
        _ => None,
    }
}
