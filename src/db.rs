use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("enrolld.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            year INTEGER NOT NULL UNIQUE,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            is_completed INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_terms(
            id TEXT PRIMARY KEY,
            year_id TEXT NOT NULL,
            term INTEGER NOT NULL CHECK(term IN (1, 2, 3)),
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0,
            is_completed INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(year_id) REFERENCES academic_years(id),
            UNIQUE(year_id, term)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_academic_terms_year ON academic_terms(year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS term_fees(
            term_id TEXT PRIMARY KEY,
            amount REAL NOT NULL,
            FOREIGN KEY(term_id) REFERENCES academic_terms(id)
        )",
        [],
    )?;

    // Classes key on the year *number*, not the year row: next year's classes
    // are set up before rollover creates the AcademicYear itself.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            grade TEXT NOT NULL,
            section TEXT NOT NULL,
            year INTEGER NOT NULL,
            teacher_id TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(grade, section, year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_year ON classes(year)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_teacher ON classes(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            class_id TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'enrolled',
            archived INTEGER NOT NULL DEFAULT 0,
            deleted INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    // Append-only: rows are inserted by movement operations and never updated.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_movements(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            from_class_id TEXT,
            to_class_id TEXT,
            movement_type TEXT NOT NULL,
            previous_arrears REAL NOT NULL,
            preserved_arrears REAL NOT NULL,
            reason TEXT,
            moved_by TEXT NOT NULL,
            movement_date TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(from_class_id) REFERENCES classes(id),
            FOREIGN KEY(to_class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_movements_student ON student_movements(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_balances(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            term_fee REAL NOT NULL,
            previous_arrears REAL NOT NULL,
            amount_paid REAL NOT NULL DEFAULT 0,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(term_id) REFERENCES academic_terms(id),
            UNIQUE(student_id, term_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_balances_student ON student_balances(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_balances_term ON student_balances(term_id)",
        [],
    )?;

    Ok(conn)
}
