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
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
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
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("gradebook-router-smoke");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "lastName": "Smoke", "firstName": "Student" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "4", "students.list", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.update",
        json!({ "studentId": student_id, "patch": { "firstName": "Updated" } }),
    );

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "courses.create",
        json!({ "code": "MATH-101", "name": "Mathematics" }),
    );
    let course_id = course
        .get("courseId")
        .and_then(|v| v.as_str())
        .expect("courseId")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "7", "courses.list", json!({}));

    let grade = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.create",
        json!({
            "studentId": student_id,
            "courseId": course_id,
            "academicYear": "2025-2026",
            "semester": 1
        }),
    );
    let grade_id = grade
        .get("gradeId")
        .and_then(|v| v.as_str())
        .expect("gradeId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.open",
        json!({ "gradeId": grade_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "grades.listForCourse",
        json!({ "courseId": course_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.updateComponents",
        json!({
            "gradeId": grade_id,
            "patch": { "midterm": { "maxScore": 100.0, "score": 80.0 } }
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "grades.publish",
        json!({ "gradeId": grade_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "grades.unpublish",
        json!({ "gradeId": grade_id }),
    );

    let day = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "attendance.dayCreate",
        json!({ "courseId": course_id, "date": "2026-02-10" }),
    );
    let day_id = day
        .get("dayId")
        .and_then(|v| v.as_str())
        .expect("dayId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "attendance.setStatus",
        json!({ "dayId": day_id, "studentId": student_id, "status": "present" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "attendance.dayOpen",
        json!({ "dayId": day_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "attendance.listForCourse",
        json!({ "courseId": course_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "attendance.lock",
        json!({ "dayId": day_id, "lockedBy": "teacher-1" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "attendance.unlock",
        json!({ "dayId": day_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "attendance.dayDelete",
        json!({ "dayId": day_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "grades.delete",
        json!({ "gradeId": grade_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "courses.delete",
        json!({ "courseId": course_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "23",
        "students.delete",
        json!({ "studentId": student_id }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
