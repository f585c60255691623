//! Field and column definitions.

use crate::types::SqlType;

/// Metadata about a mapped attribute/column.
///
/// Entities expose a `&'static [FieldInfo]` arena; the mapping registry
/// resolves it once at startup instead of reflecting over the type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Rust field name
    pub name: &'static str,
    /// Store column name (may differ from field name)
    pub column_name: &'static str,
    /// Column type for this field
    pub sql_type: SqlType,
    /// Whether this field is nullable
    pub nullable: bool,
    /// Whether this is the primary key
    pub primary_key: bool,
    /// Whether this field has a unique constraint
    pub unique: bool,
    /// Foreign key reference (table.column)
    pub foreign_key: Option<&'static str>,
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
            unique: false,
            foreign_key: None,
        }
    }

    /// Set nullable flag.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set primary key flag.
    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    /// Set unique flag.
    pub const fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        self
    }

    /// Set foreign key reference (`"table.column"`).
    pub const fn foreign_key(mut self, reference: &'static str) -> Self {
        self.foreign_key = Some(reference);
        self
    }

    /// Split the foreign key reference into `(table, column)`.
    pub fn foreign_key_parts(&self) -> Option<(&'static str, &'static str)> {
        let fk = self.foreign_key?;
        let (table, column) = fk.split_once('.')?;
        if table.is_empty() || column.is_empty() {
            return None;
        }
        Some((table, column))
    }
}
