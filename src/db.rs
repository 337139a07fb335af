use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("gradebook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;

    // One record per (student, course, year, semester); the UNIQUE constraint
    // carries that invariant. Repeating components are stored as JSON arrays,
    // fixed components as max/score column pairs (score NULL until graded).
    // percentage/letter_grade/gpa are derived and rewritten on every save.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            semester INTEGER NOT NULL,
            assignments TEXT NOT NULL DEFAULT '[]',
            quizzes TEXT NOT NULL DEFAULT '[]',
            midterm_max REAL NOT NULL DEFAULT 100,
            midterm_score REAL,
            final_max REAL NOT NULL DEFAULT 100,
            final_score REAL,
            participation_max REAL NOT NULL DEFAULT 100,
            participation_score REAL,
            attendance_percent REAL NOT NULL DEFAULT 0,
            percentage REAL NOT NULL DEFAULT 0,
            letter_grade TEXT NOT NULL DEFAULT 'F',
            gpa REAL NOT NULL DEFAULT 0,
            is_published INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(student_id, course_id, academic_year, semester)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_course ON grade_records(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_student ON grade_records(student_id)",
        [],
    )?;

    // One roll per (course, date). Counts and percentage are derived from
    // attendance_entries and rewritten on every entry mutation.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_days(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            date TEXT NOT NULL,
            present_count INTEGER NOT NULL DEFAULT 0,
            absent_count INTEGER NOT NULL DEFAULT 0,
            late_count INTEGER NOT NULL DEFAULT 0,
            excused_count INTEGER NOT NULL DEFAULT 0,
            suspended_count INTEGER NOT NULL DEFAULT 0,
            percentage REAL NOT NULL DEFAULT 0,
            locked INTEGER NOT NULL DEFAULT 0,
            locked_by TEXT,
            locked_at TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_days_course ON attendance_days(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_entries(
            day_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(day_id, student_id),
            FOREIGN KEY(day_id) REFERENCES attendance_days(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_entries_day ON attendance_entries(day_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_entries_student ON attendance_entries(student_id)",
        [],
    )?;

    Ok(conn)
}
