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

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn setup(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
    student_count: usize,
) -> (Vec<String>, String) {
    let _ = request_ok(
        stdin,
        reader,
        "setup-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let mut student_ids = Vec::with_capacity(student_count);
    for i in 0..student_count {
        let student = request_ok(
            stdin,
            reader,
            &format!("setup-student-{}", i),
            "students.create",
            json!({ "lastName": format!("Student{}", i), "firstName": "Test" }),
        );
        student_ids.push(
            student
                .get("studentId")
                .and_then(|v| v.as_str())
                .expect("studentId")
                .to_string(),
        );
    }
    let course = request_ok(
        stdin,
        reader,
        "setup-course",
        "courses.create",
        json!({ "code": "HIS-110", "name": "World History" }),
    );
    let course_id = course
        .get("courseId")
        .and_then(|v| v.as_str())
        .expect("courseId")
        .to_string();
    (student_ids, course_id)
}

#[test]
fn roll_counts_and_percentage_follow_the_formula() {
    let workspace = temp_dir("gradebook-attendance-roll");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (students, course_id) = setup(&mut stdin, &mut reader, &workspace, 4);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "create",
        "attendance.dayCreate",
        json!({
            "courseId": course_id,
            "date": "2026-03-02",
            "entries": [
                { "studentId": students[0], "status": "present" },
                { "studentId": students[1], "status": "present" },
                { "studentId": students[2], "status": "absent" },
                { "studentId": students[3], "status": "late" }
            ]
        }),
    );
    // (present + late) / (present + absent + late + excused): (2+1)/4.
    assert_eq!(
        created.get("percentage").and_then(|v| v.as_f64()),
        Some(75.0)
    );
    let tally = created.get("tally").expect("tally");
    assert_eq!(tally.get("presentCount").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(tally.get("absentCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(tally.get("lateCount").and_then(|v| v.as_i64()), Some(1));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn empty_day_has_zero_percentage() {
    let workspace = temp_dir("gradebook-attendance-empty");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (_students, course_id) = setup(&mut stdin, &mut reader, &workspace, 1);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "create",
        "attendance.dayCreate",
        json!({ "courseId": course_id, "date": "2026-03-03" }),
    );
    assert_eq!(
        created.get("percentage").and_then(|v| v.as_f64()),
        Some(0.0)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn suspended_entries_stay_out_of_the_percentage() {
    let workspace = temp_dir("gradebook-attendance-suspended");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (students, course_id) = setup(&mut stdin, &mut reader, &workspace, 3);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "create",
        "attendance.dayCreate",
        json!({
            "courseId": course_id,
            "date": "2026-03-04",
            "entries": [
                { "studentId": students[0], "status": "present" },
                { "studentId": students[1], "status": "suspended" },
                { "studentId": students[2], "status": "absent" }
            ]
        }),
    );
    assert_eq!(
        created.get("percentage").and_then(|v| v.as_f64()),
        Some(50.0)
    );
    assert_eq!(
        created
            .get("tally")
            .and_then(|t| t.get("suspendedCount"))
            .and_then(|v| v.as_i64()),
        Some(1)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn duplicate_day_for_course_and_date_is_a_conflict() {
    let workspace = temp_dir("gradebook-attendance-duplicate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (_students, course_id) = setup(&mut stdin, &mut reader, &workspace, 1);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "create",
        "attendance.dayCreate",
        json!({ "courseId": course_id, "date": "2026-03-05" }),
    );
    let dup = request(
        &mut stdin,
        &mut reader,
        "dup",
        "attendance.dayCreate",
        json!({ "courseId": course_id, "date": "2026-03-05" }),
    );
    assert_eq!(error_code(&dup), "conflict");

    // Another date is fine.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "next-day",
        "attendance.dayCreate",
        json!({ "courseId": course_id, "date": "2026-03-06" }),
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn locking_freezes_entries_until_unlock() {
    let workspace = temp_dir("gradebook-attendance-lock");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (students, course_id) = setup(&mut stdin, &mut reader, &workspace, 2);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "create",
        "attendance.dayCreate",
        json!({
            "courseId": course_id,
            "date": "2026-03-09",
            "entries": [
                { "studentId": students[0], "status": "present" }
            ]
        }),
    );
    let day_id = created
        .get("dayId")
        .and_then(|v| v.as_str())
        .expect("dayId")
        .to_string();

    let locked = request_ok(
        &mut stdin,
        &mut reader,
        "lock",
        "attendance.lock",
        json!({ "dayId": day_id, "lockedBy": "teacher-7" }),
    );
    assert_eq!(
        locked.get("lockedBy").and_then(|v| v.as_str()),
        Some("teacher-7")
    );
    assert!(locked.get("lockedAt").and_then(|v| v.as_str()).is_some());

    let rejected = request(
        &mut stdin,
        &mut reader,
        "mutate",
        "attendance.setStatus",
        json!({ "dayId": day_id, "studentId": students[1], "status": "late" }),
    );
    assert_eq!(error_code(&rejected), "record_locked");

    let rejected_bulk = request(
        &mut stdin,
        &mut reader,
        "bulk",
        "attendance.bulkSetStatus",
        json!({
            "dayId": day_id,
            "entries": [ { "studentId": students[1], "status": "absent" } ]
        }),
    );
    assert_eq!(error_code(&rejected_bulk), "record_locked");

    let rejected_delete = request(
        &mut stdin,
        &mut reader,
        "delete",
        "attendance.dayDelete",
        json!({ "dayId": day_id }),
    );
    assert_eq!(error_code(&rejected_delete), "record_locked");

    let unlocked = request_ok(
        &mut stdin,
        &mut reader,
        "unlock",
        "attendance.unlock",
        json!({ "dayId": day_id }),
    );
    assert_eq!(unlocked.get("locked").and_then(|v| v.as_bool()), Some(false));

    // Unlock clears the locking actor and timestamp.
    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "open",
        "attendance.dayOpen",
        json!({ "dayId": day_id }),
    );
    assert!(opened.get("lockedBy").map(|v| v.is_null()).unwrap_or(false));
    assert!(opened.get("lockedAt").map(|v| v.is_null()).unwrap_or(false));

    let mutated = request_ok(
        &mut stdin,
        &mut reader,
        "mutate-again",
        "attendance.setStatus",
        json!({ "dayId": day_id, "studentId": students[1], "status": "late" }),
    );
    assert_eq!(
        mutated.get("percentage").and_then(|v| v.as_f64()),
        Some(100.0)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn status_updates_retally_in_the_same_write() {
    let workspace = temp_dir("gradebook-attendance-retally");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (students, course_id) = setup(&mut stdin, &mut reader, &workspace, 2);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "create",
        "attendance.dayCreate",
        json!({
            "courseId": course_id,
            "date": "2026-03-10",
            "entries": [
                { "studentId": students[0], "status": "absent" },
                { "studentId": students[1], "status": "absent" }
            ]
        }),
    );
    let day_id = created
        .get("dayId")
        .and_then(|v| v.as_str())
        .expect("dayId")
        .to_string();
    assert_eq!(
        created.get("percentage").and_then(|v| v.as_f64()),
        Some(0.0)
    );

    // Flip one to present: 1/2.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "flip",
        "attendance.setStatus",
        json!({ "dayId": day_id, "studentId": students[0], "status": "present" }),
    );
    assert_eq!(
        updated.get("percentage").and_then(|v| v.as_f64()),
        Some(50.0)
    );

    // Clearing an entry removes it from the roll entirely.
    let cleared = request_ok(
        &mut stdin,
        &mut reader,
        "clear",
        "attendance.setStatus",
        json!({ "dayId": day_id, "studentId": students[1], "status": null }),
    );
    assert_eq!(
        cleared.get("percentage").and_then(|v| v.as_f64()),
        Some(100.0)
    );

    let _ = std::fs::remove_dir_all(workspace);
}
