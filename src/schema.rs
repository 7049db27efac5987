//! Per-plugin table definitions and schema initialization.
//!
//! Every handler owns one schema (an attached SQLite database). At startup
//! each plugin in plan order declares its tables into a [`SchemaBuilder`],
//! and the collected DDL runs before the first file is handled, so a
//! dependent plugin always finds its prerequisites' tables in place.

use anyhow::{Context, Result};
use std::fmt;

use crate::resolver::ExecutionPlan;
use crate::store::Store;
use crate::upsert::Statement;

/// A table inside a plugin schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// `"schema"."name"`, ready to splice into SQL.
    pub fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.name)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

/// Collects `CREATE ... IF NOT EXISTS` statements for one schema.
#[derive(Debug)]
pub struct SchemaBuilder {
    schema: String,
    statements: Vec<String>,
    tables: Vec<TableRef>,
}

impl SchemaBuilder {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            statements: Vec::new(),
            tables: Vec::new(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Declare a table. `id INTEGER PRIMARY KEY AUTOINCREMENT` is prepended;
    /// `columns` holds column and table-constraint definitions verbatim.
    pub fn table(&mut self, name: &str, columns: &[&str]) -> TableRef {
        let table = TableRef::new(self.schema.clone(), name);
        let mut body = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT"];
        body.extend_from_slice(columns);
        self.statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            table.qualified(),
            body.join(",\n    ")
        ));
        self.tables.push(table.clone());
        table
    }

    /// Declare a non-unique index over `columns` of `table`.
    pub fn index(&mut self, table: &TableRef, columns: &[&str]) {
        // Index and table live in the same attached database, so only the
        // index name is qualified.
        let index_name = format!("idx_{}_{}", table.name, columns.join("_"));
        self.statements.push(format!(
            "CREATE INDEX IF NOT EXISTS \"{}\".\"{}\" ON \"{}\" ({})",
            self.schema,
            index_name,
            table.name,
            columns.join(", ")
        ));
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn tables(&self) -> &[TableRef] {
        &self.tables
    }
}

/// Create every plugin's tables, in plan order.
pub async fn initialize(store: &Store, plan: &ExecutionPlan) -> Result<()> {
    for plugin in plan.plugins() {
        let mut builder = SchemaBuilder::new(plugin.database_schema());
        plugin.define_tables(&mut builder);
        for sql in builder.statements() {
            store
                .execute(&Statement::new(sql.as_str()))
                .await
                .with_context(|| format!("Failed to initialize schema for {}", plugin.name()))?;
        }
        tracing::info!(
            plugin = plugin.name(),
            schema = builder.schema(),
            tables = builder.tables().len(),
            "schema ready"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_and_index_ddl() {
        let mut builder = SchemaBuilder::new("core");
        let mime = builder.table("file_mime", &["mime TEXT NOT NULL UNIQUE"]);
        builder.index(&mime, &["mime"]);

        assert_eq!(mime.qualified(), "\"core\".\"file_mime\"");
        assert_eq!(builder.tables(), &[mime]);
        assert_eq!(builder.statements().len(), 2);
        assert!(builder.statements()[0]
            .starts_with("CREATE TABLE IF NOT EXISTS \"core\".\"file_mime\""));
        assert!(builder.statements()[0].contains("id INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert_eq!(
            builder.statements()[1],
            "CREATE INDEX IF NOT EXISTS \"core\".\"idx_file_mime_mime\" ON \"file_mime\" (mime)"
        );
    }
}
