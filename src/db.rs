use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("orgportal.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            username TEXT UNIQUE,
            password_hash TEXT,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'member',
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            secret_sha256 TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS orgs(
            username TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            adviser_email TEXT,
            accreditation TEXT,
            avatar_url TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS members(
            id TEXT PRIMARY KEY,
            org_username TEXT NOT NULL,
            student_name TEXT NOT NULL,
            school_year TEXT NOT NULL,
            FOREIGN KEY(org_username) REFERENCES orgs(username),
            UNIQUE(org_username, student_name, school_year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_members_org ON members(org_username)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluation_templates(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            instructions TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluation_template_questions(
            id TEXT PRIMARY KEY,
            template_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            text TEXT NOT NULL,
            options TEXT,
            scale INTEGER,
            sort_order INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(template_id) REFERENCES evaluation_templates(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_template_questions_template
         ON evaluation_template_questions(template_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_template_questions_template_sort
         ON evaluation_template_questions(template_id, sort_order)",
        [],
    )?;

    // Single-row pointer to the template new evaluations are built from. The
    // pointer is the authority; the `active` flag on template rows is kept
    // for listing and history.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS portal_config(
            id INTEGER PRIMARY KEY CHECK(id = 1),
            active_template_id TEXT,
            FOREIGN KEY(active_template_id) REFERENCES evaluation_templates(id)
        )",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO portal_config(id, active_template_id) VALUES (1, NULL)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS org_evaluations(
            id TEXT PRIMARY KEY,
            org_username TEXT NOT NULL,
            template_id TEXT NOT NULL,
            school_year TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            archived INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(org_username) REFERENCES orgs(username),
            FOREIGN KEY(template_id) REFERENCES evaluation_templates(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_org_evaluations_org ON org_evaluations(org_username)",
        [],
    )?;
    // At most one active evaluation per org, enforced by the store rather
    // than by lookup-before-insert alone.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_org_evaluations_one_active
         ON org_evaluations(org_username) WHERE active = 1",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS org_evaluation_responses(
            id TEXT PRIMARY KEY,
            org_evaluation_id TEXT NOT NULL,
            org_username TEXT NOT NULL,
            member_id TEXT NOT NULL,
            respondent_email TEXT NOT NULL,
            answers TEXT NOT NULL,
            submitted INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(org_evaluation_id) REFERENCES org_evaluations(id),
            FOREIGN KEY(member_id) REFERENCES members(id),
            UNIQUE(org_evaluation_id, member_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_responses_evaluation
         ON org_evaluation_responses(org_evaluation_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_responses_member
         ON org_evaluation_responses(member_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS requirements(
            id TEXT PRIMARY KEY,
            section TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS org_requirement_statuses(
            id TEXT PRIMARY KEY,
            org_username TEXT NOT NULL,
            requirement_id TEXT NOT NULL,
            starts_at TEXT,
            due_at TEXT,
            submitted INTEGER NOT NULL DEFAULT 0,
            graded INTEGER NOT NULL DEFAULT 0,
            score REAL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(org_username) REFERENCES orgs(username),
            FOREIGN KEY(requirement_id) REFERENCES requirements(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_req_statuses_org
         ON org_requirement_statuses(org_username)",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_req_statuses_one_active
         ON org_requirement_statuses(org_username, requirement_id) WHERE active = 1",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS comments(
            id TEXT PRIMARY KEY,
            org_username TEXT NOT NULL,
            subject_kind TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            author_email TEXT NOT NULL,
            author_name TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(org_username) REFERENCES orgs(username)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_comments_subject ON comments(subject_kind, subject_id)",
        [],
    )?;

    // Workspaces created before org profiles grew accreditation/avatar fields
    // lack the columns. Add and leave null.
    ensure_orgs_profile_columns(&conn)?;
    ensure_responses_updated_at(&conn)?;

    Ok(conn)
}

fn ensure_orgs_profile_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "orgs", "accreditation")? {
        conn.execute("ALTER TABLE orgs ADD COLUMN accreditation TEXT", [])?;
    }
    if !table_has_column(conn, "orgs", "avatar_url")? {
        conn.execute("ALTER TABLE orgs ADD COLUMN avatar_url TEXT", [])?;
    }
    Ok(())
}

fn ensure_responses_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "org_evaluation_responses", "updated_at")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE org_evaluation_responses ADD COLUMN updated_at TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
