use duckdb::Connection;

/// Number of `group_<n>_id` columns carried on the users table.
pub const MAX_GROUPS: u32 = 4;

/// SQL statement to create the events table.
///
/// `id` is assigned in insertion order and breaks timestamp ties.
pub const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS events (
    project_id      BIGINT NOT NULL,
    id              BIGINT NOT NULL,
    user_id         VARCHAR NOT NULL,
    session_id      BIGINT,
    event_name_id   BIGINT NOT NULL,
    timestamp       BIGINT NOT NULL,
    properties      VARCHAR
)
";

/// SQL statement to create the users table.
pub const CREATE_USERS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS users (
    project_id       BIGINT NOT NULL,
    id               VARCHAR NOT NULL,
    customer_user_id VARCHAR,
    properties       VARCHAR,
    group_1_id       VARCHAR,
    group_2_id       VARCHAR,
    group_3_id       VARCHAR,
    group_4_id       VARCHAR
)
";

pub const CREATE_EVENT_NAMES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS event_names (
    project_id  BIGINT NOT NULL,
    id          BIGINT NOT NULL,
    name        VARCHAR NOT NULL
)
";

/// Group definitions. `id` selects the `group_<id>_id` column on users.
pub const CREATE_GROUPS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS user_groups (
    project_id  BIGINT NOT NULL,
    id          INTEGER NOT NULL,
    name        VARCHAR NOT NULL
)
";

/// Initialize the database schema.
pub fn init_schema(conn: &Connection) -> Result<(), duckdb::Error> {
    conn.execute_batch(CREATE_EVENTS_TABLE)?;
    conn.execute_batch(CREATE_USERS_TABLE)?;
    conn.execute_batch(CREATE_EVENT_NAMES_TABLE)?;
    conn.execute_batch(CREATE_GROUPS_TABLE)?;
    Ok(())
}
