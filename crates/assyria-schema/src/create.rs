//! CREATE TABLE statement builder.

use assyria_core::{EntityDescriptor, FieldInfo, KeyStrategy, quote_ident};

/// Builder for the CREATE TABLE statement of one mapped entity.
#[derive(Debug)]
pub struct CreateTable<'a> {
    descriptor: &'a EntityDescriptor,
    if_not_exists: bool,
}

impl<'a> CreateTable<'a> {
    pub fn new(descriptor: &'a EntityDescriptor) -> Self {
        Self {
            descriptor,
            if_not_exists: false,
        }
    }

    /// Add IF NOT EXISTS clause.
    #[must_use]
    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }

    /// Build the CREATE TABLE SQL.
    ///
    /// A sequential key becomes an `INTEGER PRIMARY KEY AUTOINCREMENT`
    /// column so the store's row id is the key and ids are never reused.
    pub fn build(&self) -> String {
        let d = self.descriptor;
        let mut sql = String::from("CREATE TABLE ");

        if self.if_not_exists {
            sql.push_str("IF NOT EXISTS ");
        }

        sql.push_str(&quote_ident(d.table));
        sql.push_str(" (\n  ");

        let mut parts: Vec<String> = d.fields.iter().map(|f| self.column_definition(f)).collect();

        for field in d.fields {
            if let Some((table, column)) = field.foreign_key_parts() {
                parts.push(format!(
                    "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {}({})",
                    quote_ident(&format!("fk_{}_{}", d.table, field.column_name)),
                    quote_ident(field.column_name),
                    quote_ident(table),
                    quote_ident(column)
                ));
            }
        }

        sql.push_str(&parts.join(",\n  "));
        sql.push_str("\n)");
        sql
    }

    fn column_definition(&self, field: &FieldInfo) -> String {
        let d = self.descriptor;
        let name = quote_ident(field.column_name);

        if field.column_name == d.key_column {
            return match d.key_strategy {
                KeyStrategy::Sequential => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", name),
                KeyStrategy::ClientAssigned | KeyStrategy::CombGuid => format!(
                    "{} {} PRIMARY KEY NOT NULL",
                    name,
                    field.sql_type.sql_name()
                ),
            };
        }

        let mut def = format!("{} {}", name, field.sql_type.sql_name());
        if !field.nullable {
            def.push_str(" NOT NULL");
        }
        if field.unique {
            def.push_str(" UNIQUE");
        }
        def
    }
}

/// Generate DROP TABLE SQL.
pub fn drop_table_sql(table_name: &str, if_exists: bool) -> String {
    if if_exists {
        format!("DROP TABLE IF EXISTS {}", quote_ident(table_name))
    } else {
        format!("DROP TABLE {}", quote_ident(table_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assyria_core::{
        AssociationInfo, Entity, FromValue, Result, Row, SqlType, Uuid, Value,
    };

    #[derive(Debug, Clone)]
    struct Office {
        id: i64,
    }

    impl Entity for Office {
        const TABLE_NAME: &'static str = "offices";
        const KEY_COLUMN: &'static str = "id";
        const KEY_STRATEGY: KeyStrategy = KeyStrategy::Sequential;
        const ASSOCIATIONS: &'static [AssociationInfo] =
            &[AssociationInfo::many_to_one("country", "countries", "country_id")];

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: &[FieldInfo] = &[
                FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
                FieldInfo::new("name", "name", SqlType::Text).unique(true),
                FieldInfo::new("country", "country_id", SqlType::BigInt)
                    .nullable(true)
                    .foreign_key("countries.id"),
            ];
            FIELDS
        }

        fn key(&self) -> Value {
            Value::BigInt(self.id)
        }

        fn set_key(&mut self, key: Value) -> Result<()> {
            self.id = Option::<i64>::from_value(&key)?.unwrap_or(0);
            Ok(())
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            Vec::new()
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
            })
        }
    }

    #[derive(Debug, Clone)]
    struct Email {
        id: Uuid,
    }

    impl Entity for Email {
        const TABLE_NAME: &'static str = "emails";
        const KEY_COLUMN: &'static str = "id";
        const KEY_STRATEGY: KeyStrategy = KeyStrategy::CombGuid;

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: &[FieldInfo] = &[
                FieldInfo::new("id", "id", SqlType::Uuid).primary_key(true),
                FieldInfo::new("address", "address", SqlType::Text).nullable(true),
            ];
            FIELDS
        }

        fn key(&self) -> Value {
            Value::from(self.id)
        }

        fn set_key(&mut self, key: Value) -> Result<()> {
            self.id = Option::<Uuid>::from_value(&key)?.unwrap_or_default();
            Ok(())
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            Vec::new()
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
            })
        }
    }

    #[test]
    fn test_sequential_key_is_rowid_alias() {
        let descriptor = EntityDescriptor::of::<Office>();
        let sql = CreateTable::new(&descriptor).build();

        assert!(sql.starts_with("CREATE TABLE \"offices\" ("));
        assert!(sql.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("\"name\" TEXT NOT NULL UNIQUE"));
        assert!(sql.contains("\"country_id\" BIGINT,"));
        assert!(sql.contains(
            "CONSTRAINT \"fk_offices_country_id\" FOREIGN KEY (\"country_id\") REFERENCES \"countries\"(\"id\")"
        ));
    }

    #[test]
    fn test_comb_key_is_blob_primary_key() {
        let descriptor = EntityDescriptor::of::<Email>();
        let sql = CreateTable::new(&descriptor).if_not_exists().build();

        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"emails\""));
        assert!(sql.contains("\"id\" BLOB PRIMARY KEY NOT NULL"));
        assert!(sql.contains("\"address\" TEXT\n"));
        assert!(!sql.contains("FOREIGN KEY"));
    }

    #[test]
    fn test_drop_table_sql_quotes() {
        assert_eq!(drop_table_sql("users", true), "DROP TABLE IF EXISTS \"users\"");
        assert_eq!(drop_table_sql("order", false), "DROP TABLE \"order\"");
        assert_eq!(
            drop_table_sql("my\"table", true),
            "DROP TABLE IF EXISTS \"my\"\"table\""
        );
    }
}
