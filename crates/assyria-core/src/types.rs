//! Column type definitions.

/// Column types a mapped attribute can declare.
///
/// The embedded store only knows five storage classes, so several of these
/// share an affinity; the distinct variants keep the mapping self-describing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    BigInt,
    Real,
    Boolean,
    Text,
    Blob,
    /// 16-byte identifier stored as a blob
    Uuid,
}

impl SqlType {
    /// Get the type name used in generated DDL.
    pub const fn sql_name(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Real => "REAL",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Text => "TEXT",
            SqlType::Blob | SqlType::Uuid => "BLOB",
        }
    }

    /// Check if this is an integer type (eligible for store-assigned keys).
    pub const fn is_integer(&self) -> bool {
        matches!(self, SqlType::Integer | SqlType::BigInt)
    }
}
