//! In-memory store state shared by the memory and JSON file backends.
//!
//! All operations are synchronous; the backends wrap this in their own lock
//! so every trait call is a single critical section (which is what makes the
//! conditional inserts atomic).

use fv_core::types::InsertOutcome;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{RowColumns, ScopeKeyRecord, UserKeyRecord};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    /// user_id → key record
    #[serde(default)]
    pub users: BTreeMap<String, UserKeyRecord>,
    /// user_id → scope → scope record
    #[serde(default)]
    pub scopes: BTreeMap<String, BTreeMap<String, ScopeKeyRecord>>,
    /// user_id → table → row_id → columns
    #[serde(default)]
    pub rows: BTreeMap<String, BTreeMap<String, BTreeMap<String, RowColumns>>>,
}

impl StoreState {
    pub fn load_user(&self, user_id: &str) -> Option<UserKeyRecord> {
        self.users.get(user_id).cloned()
    }

    pub fn put_user_if_vacant(&mut self, record: UserKeyRecord) -> InsertOutcome {
        if let Some(existing) = self.users.get(&record.user_id) {
            if existing.has_master_key() {
                return InsertOutcome::AlreadyExists;
            }
        }
        self.users.insert(record.user_id.clone(), record);
        InsertOutcome::Inserted
    }

    pub fn clear_master_key(&mut self, user_id: &str) -> bool {
        match self.users.get_mut(user_id) {
            Some(user) => {
                let had_key = user.has_master_key();
                user.wrapped_master_key = None;
                user.wrapped_master_key_iv = None;
                had_key
            }
            None => false,
        }
    }

    pub fn load_scope(&self, user_id: &str, scope: &str) -> Option<ScopeKeyRecord> {
        self.scopes.get(user_id)?.get(scope).cloned()
    }

    pub fn insert_scope_if_absent(&mut self, record: ScopeKeyRecord) -> InsertOutcome {
        let user_scopes = self.scopes.entry(record.user_id.clone()).or_default();
        if user_scopes.contains_key(&record.scope) {
            return InsertOutcome::AlreadyExists;
        }
        user_scopes.insert(record.scope.clone(), record);
        InsertOutcome::Inserted
    }

    pub fn delete_scopes(&mut self, user_id: &str) -> u64 {
        self.scopes
            .remove(user_id)
            .map(|s| s.len() as u64)
            .unwrap_or(0)
    }

    pub fn upsert_columns(
        &mut self,
        user_id: &str,
        table: &str,
        row_id: &str,
        columns: RowColumns,
    ) {
        self.rows
            .entry(user_id.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default()
            .entry(row_id.to_string())
            .or_default()
            .extend(columns);
    }

    /// Drop `columns` from a row. Returns whether anything was removed.
    pub fn clear_columns(
        &mut self,
        user_id: &str,
        table: &str,
        row_id: &str,
        columns: &[String],
    ) -> bool {
        let Some(row) = self
            .rows
            .get_mut(user_id)
            .and_then(|tables| tables.get_mut(table))
            .and_then(|rows| rows.get_mut(row_id))
        else {
            return false;
        };
        let before = row.len();
        for column in columns {
            row.remove(column);
        }
        row.len() != before
    }

    pub fn load_row(&self, user_id: &str, table: &str, row_id: &str) -> Option<RowColumns> {
        self.rows.get(user_id)?.get(table)?.get(row_id).cloned()
    }

    pub fn find_rows(&self, user_id: &str, table: &str, column: &str, value: &str) -> Vec<String> {
        let Some(rows) = self.rows.get(user_id).and_then(|t| t.get(table)) else {
            return Vec::new();
        };
        rows.iter()
            .filter(|(_, cols)| cols.get(column).is_some_and(|v| v == value))
            .map(|(row_id, _)| row_id.clone())
            .collect()
    }

    pub fn delete_rows(&mut self, user_id: &str) -> u64 {
        self.rows
            .remove(user_id)
            .map(|tables| tables.values().map(|rows| rows.len() as u64).sum())
            .unwrap_or(0)
    }
}
