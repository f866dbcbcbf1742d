//! Field and column definitions.

use crate::types::SqlType;

/// Metadata about a mapped column.
///
/// Built with `const` builder methods so entities can expose a
/// `&'static [FieldInfo]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Rust field name
    pub name: &'static str,
    /// Database column name (may differ from field name)
    pub column_name: &'static str,
    /// SQL type for this field
    pub sql_type: SqlType,
    /// Whether this field is nullable
    pub nullable: bool,
    /// Whether this is part of the primary key
    pub primary_key: bool,
    /// Whether this column holds the optimistic-lock version
    pub version: bool,
    /// Whether the column is written on INSERT
    pub insertable: bool,
    /// Whether the column is written on UPDATE
    pub updatable: bool,
    /// Foreign key reference (table.column)
    pub foreign_key: Option<&'static str>,
    /// Whether the column is part of the entity's natural identifier
    pub natural_id: bool,
}

impl FieldInfo {
    /// Create a new field info with minimal required data.
    pub const fn new(name: &'static str, column_name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            column_name,
            sql_type,
            nullable: false,
            primary_key: false,
            version: false,
            insertable: true,
            updatable: true,
            foreign_key: None,
            natural_id: false,
        }
    }

    /// Set nullable flag.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Mark as primary key. Key columns are never updatable.
    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        if value {
            self.updatable = false;
        }
        self
    }

    /// Mark as the version column.
    pub const fn version(mut self, value: bool) -> Self {
        self.version = value;
        self
    }

    /// Set whether the column is written on INSERT.
    pub const fn insertable(mut self, value: bool) -> Self {
        self.insertable = value;
        self
    }

    /// Set whether the column is written on UPDATE.
    pub const fn updatable(mut self, value: bool) -> Self {
        self.updatable = value;
        self
    }

    /// Set foreign key reference.
    pub const fn foreign_key(mut self, fk: &'static str) -> Self {
        self.foreign_key = Some(fk);
        self
    }

    /// Mark as part of the natural identifier.
    pub const fn natural_id(mut self, value: bool) -> Self {
        self.natural_id = value;
        self
    }

    /// Table named by the foreign key reference, if any.
    pub fn referenced_table(&self) -> Option<&'static str> {
        self.foreign_key.and_then(|fk| fk.split('.').next())
    }
}

/// Columns making up the natural identifier, in declaration order.
pub fn natural_id_columns(fields: &[FieldInfo]) -> Vec<&'static str> {
    fields
        .iter()
        .filter(|f| f.natural_id)
        .map(|f| f.column_name)
        .collect()
}

/// Find a field by column name.
pub fn field_for_column<'a>(fields: &'a [FieldInfo], column: &str) -> Option<&'a FieldInfo> {
    fields.iter().find(|f| f.column_name == column)
}
