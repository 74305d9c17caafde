pub mod executor;
pub mod metadata;
pub mod migrations;
pub mod schema;
