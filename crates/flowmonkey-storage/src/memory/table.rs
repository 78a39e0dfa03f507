//! In-memory TableRegistry and TableStore

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use flowmonkey_core::{RowFilter, TableDefinition, TableRow};

use crate::stores::{StoreError, TableRegistry, TableStore};

/// In-memory table definitions plus row storage
///
/// One struct backs both contracts so row validation can consult the
/// definitions, the way a relational schema would.
#[derive(Default)]
pub struct InMemoryTableStore {
    definitions: RwLock<HashMap<String, TableDefinition>>,
    rows: RwLock<HashMap<String, Vec<(Uuid, Option<String>, TableRow)>>>,
}

impl InMemoryTableStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in a table
    pub fn row_count(&self, table_id: &str) -> usize {
        self.rows.read().get(table_id).map_or(0, Vec::len)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.definitions.write().clear();
        self.rows.write().clear();
    }
}

#[async_trait]
impl TableRegistry for InMemoryTableStore {
    async fn create_table(&self, definition: TableDefinition) -> Result<(), StoreError> {
        let mut definitions = self.definitions.write();
        if definitions.contains_key(&definition.id) {
            return Err(StoreError::DuplicateTable(definition.id));
        }
        definitions.insert(definition.id.clone(), definition);
        Ok(())
    }

    async fn get_table(&self, table_id: &str) -> Result<Option<TableDefinition>, StoreError> {
        Ok(self.definitions.read().get(table_id).cloned())
    }

    async fn list_tables(&self) -> Result<Vec<TableDefinition>, StoreError> {
        let definitions = self.definitions.read();
        let mut tables: Vec<TableDefinition> = definitions.values().cloned().collect();
        tables.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tables)
    }

    async fn delete_table(&self, table_id: &str) -> Result<bool, StoreError> {
        self.rows.write().remove(table_id);
        Ok(self.definitions.write().remove(table_id).is_some())
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn insert_row(
        &self,
        table_id: &str,
        tenant_id: Option<&str>,
        row: TableRow,
    ) -> Result<Uuid, StoreError> {
        let definitions = self.definitions.read();
        let definition = definitions
            .get(table_id)
            .ok_or_else(|| StoreError::TableNotFound(table_id.to_string()))?;

        definition
            .validate_row(&row)
            .map_err(|message| StoreError::RowRejected {
                table_id: table_id.to_string(),
                message,
            })?;
        drop(definitions);

        let row_id = Uuid::now_v7();
        self.rows
            .write()
            .entry(table_id.to_string())
            .or_default()
            .push((row_id, tenant_id.map(str::to_string), row));
        Ok(row_id)
    }

    async fn get_row(&self, table_id: &str, row_id: Uuid) -> Result<Option<TableRow>, StoreError> {
        let rows = self.rows.read();
        Ok(rows
            .get(table_id)
            .and_then(|rows| rows.iter().find(|(id, _, _)| *id == row_id))
            .map(|(_, _, row)| row.clone()))
    }

    async fn query_rows(
        &self,
        table_id: &str,
        filters: &[RowFilter],
        limit: usize,
    ) -> Result<Vec<TableRow>, StoreError> {
        if !self.definitions.read().contains_key(table_id) {
            return Err(StoreError::TableNotFound(table_id.to_string()));
        }

        let rows = self.rows.read();
        Ok(rows
            .get(table_id)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, _, row)| filters.iter().all(|f| f.matches(row)))
                    .take(limit)
                    .map(|(_, _, row)| row.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_row(&self, table_id: &str, row_id: Uuid) -> Result<bool, StoreError> {
        let mut rows = self.rows.write();
        let Some(table_rows) = rows.get_mut(table_id) else {
            return Ok(false);
        };

        let before = table_rows.len();
        table_rows.retain(|(id, _, _)| *id != row_id);
        Ok(table_rows.len() < before)
    }
}
