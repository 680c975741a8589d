use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "schoolbook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS representatives(
            id TEXT PRIMARY KEY,
            id_type TEXT NOT NULL,
            id_number TEXT NOT NULL,
            first_names TEXT NOT NULL,
            last_names TEXT NOT NULL,
            relationship TEXT,
            phone TEXT,
            email TEXT,
            address TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_representatives_id_number ON representatives(id_number)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            id_type TEXT NOT NULL,
            id_number TEXT NOT NULL,
            first_names TEXT NOT NULL,
            last_names TEXT NOT NULL,
            birth_date TEXT,
            birth_place TEXT,
            sex TEXT,
            representative_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(representative_id) REFERENCES representatives(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_students_id_number ON students(id_number)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_representative ON students(representative_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            id_type TEXT NOT NULL,
            id_number TEXT NOT NULL,
            first_names TEXT NOT NULL,
            last_names TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            specialty TEXT,
            hired_at TEXT,
            state TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_teachers_id_number ON teachers(id_number)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            level TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_periods(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS lapses(
            id TEXT PRIMARY KEY,
            school_period_id TEXT NOT NULL,
            number INTEGER NOT NULL,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(school_period_id) REFERENCES school_periods(id),
            UNIQUE(school_period_id, number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cutoffs(
            id TEXT PRIMARY KEY,
            lapse_id TEXT,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(lapse_id) REFERENCES lapses(id)
        )",
        [],
    )?;
    // Backstop for the single-ACTIVE rule checked by the handlers.
    for table in ["school_periods", "lapses", "cutoffs"] {
        conn.execute(
            &format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_{table}_single_active
                 ON {table}(status) WHERE status = 'ACTIVE'"
            ),
            [],
        )?;
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            school_period_id TEXT NOT NULL,
            level TEXT NOT NULL,
            label TEXT NOT NULL,
            guide_teacher_id TEXT,
            capacity INTEGER NOT NULL,
            state TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            FOREIGN KEY(school_period_id) REFERENCES school_periods(id),
            FOREIGN KEY(guide_teacher_id) REFERENCES teachers(id),
            UNIQUE(school_period_id, level, label)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_period ON sections(school_period_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            school_period_id TEXT NOT NULL,
            status TEXT NOT NULL,
            enrolled_at TEXT NOT NULL,
            withdrawn_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(school_period_id) REFERENCES school_periods(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_section ON enrollments(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_subject_assignments(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            school_period_id TEXT NOT NULL,
            state TEXT NOT NULL,
            notes TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(school_period_id) REFERENCES school_periods(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tsa_teacher ON teacher_subject_assignments(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_grade_assignments(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            school_period_id TEXT NOT NULL,
            state TEXT NOT NULL,
            notes TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(school_period_id) REFERENCES school_periods(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tga_teacher ON teacher_grade_assignments(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluations(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            school_period_id TEXT NOT NULL,
            lapse_id TEXT NOT NULL,
            percentage REAL NOT NULL,
            eval_date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(school_period_id) REFERENCES school_periods(id),
            FOREIGN KEY(lapse_id) REFERENCES lapses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_section ON evaluations(section_id, subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluation_criteria(
            evaluation_id TEXT NOT NULL,
            number INTEGER NOT NULL,
            name TEXT NOT NULL,
            weight REAL NOT NULL,
            PRIMARY KEY(evaluation_id, number),
            FOREIGN KEY(evaluation_id) REFERENCES evaluations(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            evaluation_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            final_score REAL NOT NULL,
            remark TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(evaluation_id) REFERENCES evaluations(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(evaluation_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_scores(
            grade_id TEXT NOT NULL,
            criterion_number INTEGER NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY(grade_id, criterion_number),
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_history(
            id TEXT PRIMARY KEY,
            grade_id TEXT NOT NULL,
            changed_at TEXT NOT NULL,
            old_score REAL NOT NULL,
            new_score REAL NOT NULL,
            reason TEXT NOT NULL,
            actor TEXT NOT NULL,
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_history_grade ON grade_history(grade_id)",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
