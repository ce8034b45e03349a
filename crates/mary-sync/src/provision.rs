use mary_adapters::{EntitySchema, AD_STATS, PLACEMENTS, STATS};
use mary_core::{EntityKind, TableRef};
use mary_storage::{create_database_sql, ColumnStore, EntityRow};
use tracing::info;

use crate::SyncError;

/// Creates the target database and tables when missing. Existing objects are
/// left exactly as they are.
pub struct Provisioner<'a, S: ?Sized> {
    store: &'a S,
    database: &'a str,
}

impl<'a, S: ColumnStore + ?Sized> Provisioner<'a, S> {
    pub fn new(store: &'a S, database: &'a str) -> Self {
        Self { store, database }
    }

    pub async fn ensure_database(&self) -> Result<(), SyncError> {
        let database = mary_core::validate_identifier(self.database.to_string())?;
        info!(database = %database, "create database");
        self.store
            .execute(&create_database_sql(&database))
            .await
            .map_err(|source| SyncError::Store {
                stage: "create database",
                target: database,
                source,
            })
    }

    pub async fn ensure_table<R: EntityRow>(&self, schema: &EntitySchema<R>) -> Result<TableRef, SyncError> {
        let table = schema.table_ref(self.database)?;
        info!(table = %table, "create table");
        self.store
            .execute(&schema.create_table_sql(&table))
            .await
            .map_err(|source| SyncError::Store {
                stage: "create table",
                target: table.to_string(),
                source,
            })?;
        Ok(table)
    }
}

/// Creates the database and the tables of `entities`.
pub async fn provision_all<S: ColumnStore + ?Sized>(
    store: &S,
    database: &str,
    entities: &[EntityKind],
) -> Result<Vec<TableRef>, SyncError> {
    let provisioner = Provisioner::new(store, database);
    provisioner.ensure_database().await?;
    let mut tables = Vec::with_capacity(entities.len());
    for entity in entities {
        let table = match entity {
            EntityKind::Placements => provisioner.ensure_table(&PLACEMENTS).await?,
            EntityKind::Stats => provisioner.ensure_table(&STATS).await?,
            EntityKind::AdStats => provisioner.ensure_table(&AD_STATS).await?,
        };
        tables.push(table);
    }
    Ok(tables)
}
