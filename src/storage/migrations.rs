use duckdb::Connection;

const CURRENT_VERSION: u32 = 2;

/// Initialize the schema version tracking table and run any pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), duckdb::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL, applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP)",
    )?;

    let current = get_current_version(conn)?;

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn get_current_version(conn: &Connection) -> Result<u32, duckdb::Error> {
    let mut stmt = conn.prepare("SELECT COALESCE(MAX(version), 0) FROM schema_version")?;
    stmt.query_row([], |row| row.get(0))
}

fn record_version(conn: &Connection, version: u32) -> Result<(), duckdb::Error> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<(), duckdb::Error> {
    // V1: events, users and their catalogs
    crate::storage::schema::init_schema(conn)?;
    record_version(conn, 1)
}

fn migrate_v2(conn: &Connection) -> Result<(), duckdb::Error> {
    // V2: lookup indexes for step candidate scans
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_events_project_name ON events (project_id, event_name_id);
         CREATE INDEX IF NOT EXISTS idx_users_project_id ON users (project_id, id);",
    )?;
    record_version(conn, CURRENT_VERSION)
}
