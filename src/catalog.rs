//! The table catalog: a name-to-file registry.
//!
//! The catalog is a consumer-facing collaborator of the storage core: it
//! maps table names and ids to their heap files and can bootstrap a set of
//! tables from a plain-text schema file with lines of the form
//! `name (field type [pk], field type, ...)`.

pub mod schema;

use crate::access::value::FieldType;
use crate::storage::disk::HeapFile;
use crate::storage::error::{StorageError, StorageResult};
use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use self::schema::{Column, Schema};
use std::path::Path;
use std::sync::Arc;

/// Stable identity of one table, derived from its backing file.
pub type TableId = u64;

pub struct Catalog {
    tables: DashMap<TableId, Arc<HeapFile>>,
    names: DashMap<String, TableId>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            names: DashMap::new(),
        }
    }

    /// Registers a heap file under `name`, replacing any previous table of
    /// the same name, and returns its id.
    pub fn add_table(&self, name: &str, file: Arc<HeapFile>) -> TableId {
        let table_id = file.table_id();
        if let Some((_, old_id)) = self.names.remove(name) {
            self.tables.remove(&old_id);
        }
        self.tables.insert(table_id, file);
        self.names.insert(name.to_string(), table_id);
        table_id
    }

    pub fn table(&self, table_id: TableId) -> StorageResult<Arc<HeapFile>> {
        self.tables
            .get(&table_id)
            .map(|entry| entry.value().clone())
            .ok_or(StorageError::UnknownTable(table_id))
    }

    pub fn table_by_name(&self, name: &str) -> Option<Arc<HeapFile>> {
        let table_id = *self.names.get(name)?.value();
        self.tables.get(&table_id).map(|entry| entry.value().clone())
    }

    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.names.get(name).map(|entry| *entry.value())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.names.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Loads a schema file, creating (or opening) one data file per line in
    /// the schema file's directory and registering each table.
    pub fn load_schema(&self, path: &Path) -> Result<()> {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schema file {:?}", path))?;

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (name, schema) = parse_table_line(line)
                .with_context(|| format!("bad table definition on line {}", line_no + 1))?;

            let data_path = base.join(format!("{}.dat", name));
            let file = HeapFile::open(&data_path, Arc::new(schema))
                .with_context(|| format!("failed to open data file for table {}", name))?;
            self.add_table(&name, Arc::new(file));
        }
        Ok(())
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_table_line(line: &str) -> Result<(String, Schema)> {
    let open = line.find('(').context("missing '('")?;
    let close = line.rfind(')').context("missing ')'")?;
    if close < open {
        bail!("')' before '('");
    }

    let name = line[..open].trim();
    if name.is_empty() {
        bail!("missing table name");
    }

    let mut columns = Vec::new();
    for part in line[open + 1..close].split(',') {
        let tokens: Vec<&str> = part.split_whitespace().collect();
        let (field, ty, pk) = match tokens.as_slice() {
            [field, ty] => (*field, *ty, false),
            [field, ty, marker] if marker.eq_ignore_ascii_case("pk") => (*field, *ty, true),
            _ => bail!("bad column definition: {:?}", part.trim()),
        };
        let field_type = match ty.to_ascii_lowercase().as_str() {
            "int" => FieldType::Int,
            "string" => FieldType::Text,
            other => bail!("unknown field type: {}", other),
        };
        columns.push(if pk {
            Column::primary_key(field, field_type)
        } else {
            Column::new(field, field_type)
        });
    }
    if columns.is_empty() {
        bail!("table {} has no columns", name);
    }

    Ok((name.to_string(), Schema::new(columns)))
}
