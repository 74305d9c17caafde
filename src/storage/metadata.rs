use crate::error::{FunnelError, Result};
use crate::query::spec::{validate_property_name, Entity};
use crate::storage::schema::MAX_GROUPS;
use duckdb::Connection;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A named user group, stored as one of the `group_<id>_id` columns on users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDescriptor {
    pub id: u32,
    pub name: String,
}

impl GroupDescriptor {
    pub fn column(&self) -> String {
        format!("group_{}_id", self.id)
    }
}

/// Lookups the compiler needs before it can emit SQL.
pub trait MetadataResolver {
    /// Identifier of the named event in the project, if it exists.
    fn resolve_event_name(&self, project_id: i64, name: &str) -> Result<Option<i64>>;

    fn resolve_group(&self, project_id: i64, name: &str) -> Result<Option<GroupDescriptor>>;

    /// Whether any event or user of the project carries the property.
    fn property_exists(&self, project_id: i64, entity: Entity, name: &str) -> Result<bool>;
}

/// Map an empty `query_row` result to `None`.
fn optional<T>(result: duckdb::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn checked_group(project_id: i64, id: u32, name: String) -> Result<GroupDescriptor> {
    if !(1..=MAX_GROUPS).contains(&id) {
        return Err(FunnelError::InvalidSpec(format!(
            "group {name} of project {project_id} has unsupported id {id}"
        )));
    }
    Ok(GroupDescriptor { id, name })
}

/// Resolves metadata from the catalog tables of a DuckDB connection.
#[derive(Clone)]
pub struct CatalogMetadata {
    conn: Arc<Mutex<Connection>>,
}

impl CatalogMetadata {
    pub const fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

impl MetadataResolver for CatalogMetadata {
    fn resolve_event_name(&self, project_id: i64, name: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        optional(conn.query_row(
            "SELECT id FROM event_names WHERE project_id = ? AND name = ? ORDER BY id LIMIT 1",
            duckdb::params![project_id, name],
            |row| row.get(0),
        ))
    }

    fn resolve_group(&self, project_id: i64, name: &str) -> Result<Option<GroupDescriptor>> {
        let conn = self.conn.lock();
        let id: Option<i64> = optional(conn.query_row(
            "SELECT id FROM user_groups WHERE project_id = ? AND name = ? ORDER BY id LIMIT 1",
            duckdb::params![project_id, name],
            |row| row.get(0),
        ))?;
        id.map(|id| {
            let id = u32::try_from(id).unwrap_or(0);
            checked_group(project_id, id, name.to_string())
        })
        .transpose()
    }

    fn property_exists(&self, project_id: i64, entity: Entity, name: &str) -> Result<bool> {
        validate_property_name(name)?;
        let table = match entity {
            Entity::Event => "events",
            Entity::User => "users",
        };
        // The name is validated above, so it can be embedded in the JSON path.
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {table} WHERE project_id = ? \
             AND json_extract_string(properties, '$.\"{name}\"') IS NOT NULL)"
        );
        let conn = self.conn.lock();
        let exists: bool = conn.query_row(&sql, [project_id], |row| row.get(0))?;
        Ok(exists)
    }
}

/// In-memory metadata, for tests and for callers that keep their own catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    events: HashMap<(i64, String), i64>,
    groups: HashMap<(i64, String), GroupDescriptor>,
    properties: HashSet<(i64, Entity, String)>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_event(mut self, project_id: i64, name: &str, id: i64) -> Self {
        self.events.insert((project_id, name.to_string()), id);
        self
    }

    #[must_use]
    pub fn with_group(mut self, project_id: i64, name: &str, id: u32) -> Self {
        self.groups.insert(
            (project_id, name.to_string()),
            GroupDescriptor {
                id,
                name: name.to_string(),
            },
        );
        self
    }

    #[must_use]
    pub fn with_property(mut self, project_id: i64, entity: Entity, name: &str) -> Self {
        self.properties.insert((project_id, entity, name.to_string()));
        self
    }
}

impl MetadataResolver for StaticMetadata {
    fn resolve_event_name(&self, project_id: i64, name: &str) -> Result<Option<i64>> {
        Ok(self.events.get(&(project_id, name.to_string())).copied())
    }

    fn resolve_group(&self, project_id: i64, name: &str) -> Result<Option<GroupDescriptor>> {
        self.groups
            .get(&(project_id, name.to_string()))
            .map(|g| checked_group(project_id, g.id, g.name.clone()))
            .transpose()
    }

    fn property_exists(&self, project_id: i64, entity: Entity, name: &str) -> Result<bool> {
        Ok(self
            .properties
            .contains(&(project_id, entity, name.to_string())))
    }
}
