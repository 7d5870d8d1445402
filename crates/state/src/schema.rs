//! Table creation derived from the entity definitions.
//!
//! Production deployments manage the schema out of band; this is used to
//! bootstrap fresh SQLite databases in tests and local development.

use anyhow::Result;
use sea_orm::{ConnectionTrait, DatabaseConnection, Schema};

use crate::entity::{apps, comments, requirement_files, versions};

/// Create all tables if they do not already exist.
pub async fn create_tables(db: &DatabaseConnection) -> Result<()> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut stmt = schema.create_table_from_entity(apps::Entity);
    db.execute(backend.build(stmt.if_not_exists())).await?;

    let mut stmt = schema.create_table_from_entity(versions::Entity);
    db.execute(backend.build(stmt.if_not_exists())).await?;

    let mut stmt = schema.create_table_from_entity(comments::Entity);
    db.execute(backend.build(stmt.if_not_exists())).await?;

    let mut stmt = schema.create_table_from_entity(requirement_files::Entity);
    db.execute(backend.build(stmt.if_not_exists())).await?;

    Ok(())
}
