//! Mapping registry: resolved, validated descriptors of every entity type.

use crate::entity::{Entity, KeyStrategy};
use crate::error::{Error, MappingError, Result};
use crate::field::FieldInfo;
use crate::relationship::{AssociationInfo, AssociationKind};
use regex::Regex;
use std::any::TypeId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

fn identifier_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// Is `name` usable as a table or column name?
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_pattern().is_some_and(|pattern| pattern.is_match(name))
}

/// Everything the session needs to know about one mapped type.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub table: &'static str,
    pub key_column: &'static str,
    pub key_strategy: KeyStrategy,
    pub fields: &'static [FieldInfo],
    pub associations: &'static [AssociationInfo],
}

impl EntityDescriptor {
    /// Build the descriptor for `T` without validating it.
    pub fn of<T: Entity>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            table: T::TABLE_NAME,
            key_column: T::KEY_COLUMN,
            key_strategy: T::KEY_STRATEGY,
            fields: T::fields(),
            associations: T::ASSOCIATIONS,
        }
    }

    /// Column names in declaration order, key column included.
    pub fn columns(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.column_name).collect()
    }

    /// The key column's field metadata.
    pub fn key_field(&self) -> Option<&'static FieldInfo> {
        self.fields.iter().find(|f| f.column_name == self.key_column)
    }

    /// Tables this table references through foreign keys (self references
    /// excluded).
    pub fn referenced_tables(&self) -> BTreeSet<&'static str> {
        let from_fields = self
            .fields
            .iter()
            .filter_map(FieldInfo::foreign_key_parts)
            .map(|(table, _)| table);
        let from_associations = self
            .associations
            .iter()
            .filter(|a| a.is_owning())
            .map(|a| a.target_table);
        from_fields
            .chain(from_associations)
            .filter(|table| *table != self.table)
            .collect()
    }

    /// Owning many-to-one associations.
    pub fn owning_associations(&self) -> impl Iterator<Item = &'static AssociationInfo> {
        self.associations.iter().filter(|a| a.is_owning())
    }

    /// Associations that cascade save-update.
    pub fn save_update_cascades(&self) -> impl Iterator<Item = &'static AssociationInfo> {
        self.associations.iter().filter(|a| a.cascade.save_update)
    }

    /// Associations that cascade delete.
    pub fn delete_cascades(&self) -> impl Iterator<Item = &'static AssociationInfo> {
        self.associations.iter().filter(|a| a.cascade.delete)
    }

    fn mapping_error(&self, message: impl Into<String>) -> Error {
        Error::Mapping(MappingError {
            entity: self.type_name.to_string(),
            message: message.into(),
        })
    }

    fn validate(&self) -> Result<()> {
        if !is_valid_identifier(self.table) {
            return Err(self.mapping_error(format!("invalid table name '{}'", self.table)));
        }
        if self.fields.is_empty() {
            return Err(self.mapping_error("entity declares no fields"));
        }

        let mut seen = BTreeSet::new();
        for field in self.fields {
            if !is_valid_identifier(field.column_name) {
                return Err(self.mapping_error(format!(
                    "invalid column name '{}' on table '{}'",
                    field.column_name, self.table
                )));
            }
            if !seen.insert(field.column_name) {
                return Err(self.mapping_error(format!(
                    "duplicate column '{}' on table '{}'",
                    field.column_name, self.table
                )));
            }
            if field.foreign_key.is_some() && field.foreign_key_parts().is_none() {
                return Err(self.mapping_error(format!(
                    "foreign key on '{}' must be written as 'table.column'",
                    field.column_name
                )));
            }
        }

        let key = self.key_field().ok_or_else(|| {
            self.mapping_error(format!(
                "key column '{}' is not among the mapped fields",
                self.key_column
            ))
        })?;
        if !key.primary_key {
            return Err(self.mapping_error(format!(
                "key column '{}' is not flagged as primary key",
                self.key_column
            )));
        }
        if self.fields.iter().filter(|f| f.primary_key).count() != 1 {
            return Err(self.mapping_error("exactly one primary key column is supported"));
        }
        if self.key_strategy == KeyStrategy::Sequential && !key.sql_type.is_integer() {
            return Err(self.mapping_error(format!(
                "sequential key '{}' must be an integer column",
                self.key_column
            )));
        }

        for association in self.associations {
            if !is_valid_identifier(association.target_table) {
                return Err(self.mapping_error(format!(
                    "association '{}' targets invalid table '{}'",
                    association.name, association.target_table
                )));
            }
            if association.kind == AssociationKind::ManyToOne
                && !association.inverse
                && !seen.contains(association.column)
            {
                return Err(self.mapping_error(format!(
                    "association '{}' writes column '{}' which is not mapped",
                    association.name, association.column
                )));
            }
        }
        Ok(())
    }
}

/// Registry of mapped entity types.
///
/// Built once at startup and shared (behind an `Arc`) by every session.
#[derive(Debug, Default, Clone)]
pub struct MappingRegistry {
    by_type: HashMap<TypeId, EntityDescriptor>,
    by_table: BTreeMap<&'static str, TypeId>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register `T`.
    #[allow(clippy::result_large_err)]
    pub fn register<T: Entity>(&mut self) -> Result<&mut Self> {
        let descriptor = EntityDescriptor::of::<T>();
        descriptor.validate()?;

        if self.by_type.contains_key(&descriptor.type_id) {
            return Err(descriptor.mapping_error("entity type registered twice"));
        }
        if self.by_table.contains_key(descriptor.table) {
            return Err(descriptor.mapping_error(format!(
                "table '{}' is already mapped by another entity type",
                descriptor.table
            )));
        }

        tracing::debug!(
            table = descriptor.table,
            strategy = descriptor.key_strategy.as_str(),
            columns = descriptor.fields.len(),
            "Registered entity mapping"
        );
        self.by_table.insert(descriptor.table, descriptor.type_id);
        self.by_type.insert(descriptor.type_id, descriptor);
        Ok(self)
    }

    /// Builder-style variant of [`register`](Self::register).
    #[allow(clippy::result_large_err)]
    pub fn with<T: Entity>(mut self) -> Result<Self> {
        self.register::<T>()?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    pub fn is_registered<T: Entity>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<T>())
    }

    pub fn descriptor_for(&self, type_id: TypeId) -> Option<&EntityDescriptor> {
        self.by_type.get(&type_id)
    }

    /// Descriptor for `T`, or a mapping error if `T` was never registered.
    #[allow(clippy::result_large_err)]
    pub fn descriptor<T: Entity>(&self) -> Result<&EntityDescriptor> {
        self.by_type.get(&TypeId::of::<T>()).ok_or_else(|| {
            Error::Mapping(MappingError {
                entity: std::any::type_name::<T>().to_string(),
                message: "entity type is not registered".to_string(),
            })
        })
    }

    pub fn descriptor_for_table(&self, table: &str) -> Option<&EntityDescriptor> {
        self.by_table
            .get(table)
            .and_then(|type_id| self.by_type.get(type_id))
    }

    pub fn table_for(&self, type_id: TypeId) -> Option<&'static str> {
        self.descriptor_for(type_id).map(|d| d.table)
    }

    pub fn columns_for(&self, type_id: TypeId) -> Option<Vec<&'static str>> {
        self.descriptor_for(type_id).map(EntityDescriptor::columns)
    }

    pub fn key_strategy_for(&self, type_id: TypeId) -> Option<KeyStrategy> {
        self.descriptor_for(type_id).map(|d| d.key_strategy)
    }

    pub fn associations_for(&self, type_id: TypeId) -> &'static [AssociationInfo] {
        match self.descriptor_for(type_id) {
            Some(descriptor) => descriptor.associations,
            None => &[],
        }
    }

    /// All descriptors, ordered by table name.
    pub fn descriptors(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.by_table
            .values()
            .filter_map(|type_id| self.by_type.get(type_id))
    }

    /// Map of table → tables it depends on (registered ones only).
    pub fn table_dependencies(&self) -> BTreeMap<&'static str, BTreeSet<&'static str>> {
        self.descriptors()
            .map(|d| {
                let deps = d
                    .referenced_tables()
                    .into_iter()
                    .filter(|table| self.by_table.contains_key(table))
                    .collect();
                (d.table, deps)
            })
            .collect()
    }

    /// Tables ordered parents first.
    ///
    /// Ties are broken alphabetically so the order is deterministic.
    #[allow(clippy::result_large_err)]
    pub fn creation_order(&self) -> Result<Vec<&'static str>> {
        let deps = self.table_dependencies();
        let mut remaining: BTreeMap<&'static str, BTreeSet<&'static str>> = deps;
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let ready: Vec<&'static str> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(table, _)| *table)
                .collect();

            if ready.is_empty() {
                let cycle: Vec<&str> = remaining.keys().copied().collect();
                return Err(Error::Mapping(MappingError {
                    entity: cycle.join(", "),
                    message: "foreign key dependency cycle between tables".to_string(),
                }));
            }

            for table in &ready {
                remaining.remove(table);
            }
            for deps in remaining.values_mut() {
                for table in &ready {
                    deps.remove(table);
                }
            }
            order.extend(ready);
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{FromValue, Row};
    use crate::types::SqlType;
    use crate::value::Value;

    macro_rules! test_entity {
        ($name:ident, $table:literal, $strategy:expr, $fields:expr, $assocs:expr) => {
            #[derive(Debug, Clone)]
            struct $name {
                id: i64,
            }

            impl Entity for $name {
                const TABLE_NAME: &'static str = $table;
                const KEY_COLUMN: &'static str = "id";
                const KEY_STRATEGY: KeyStrategy = $strategy;
                const ASSOCIATIONS: &'static [AssociationInfo] = $assocs;

                fn fields() -> &'static [FieldInfo] {
                    static FIELDS: &[FieldInfo] = $fields;
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
        };
    }

    test_entity!(
        Country,
        "countries",
        KeyStrategy::Sequential,
        &[FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true)],
        &[]
    );
    test_entity!(
        Office,
        "offices",
        KeyStrategy::Sequential,
        &[
            FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
            FieldInfo::new("country", "country_id", SqlType::BigInt).foreign_key("countries.id"),
        ],
        &[AssociationInfo::many_to_one("country", "countries", "country_id")]
    );
    test_entity!(
        Desk,
        "desks",
        KeyStrategy::Sequential,
        &[
            FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
            FieldInfo::new("office", "office_id", SqlType::BigInt).foreign_key("offices.id"),
        ],
        &[]
    );
    test_entity!(
        NoKey,
        "no_key",
        KeyStrategy::Sequential,
        &[FieldInfo::new("id", "id", SqlType::BigInt)],
        &[]
    );
    test_entity!(
        BadTable,
        "bad table",
        KeyStrategy::Sequential,
        &[FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true)],
        &[]
    );
    test_entity!(
        TextSequence,
        "text_sequence",
        KeyStrategy::Sequential,
        &[FieldInfo::new("id", "id", SqlType::Text).primary_key(true)],
        &[]
    );
    test_entity!(
        CycleA,
        "cycle_a",
        KeyStrategy::Sequential,
        &[
            FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
            FieldInfo::new("b", "b_id", SqlType::BigInt).foreign_key("cycle_b.id"),
        ],
        &[]
    );
    test_entity!(
        CycleB,
        "cycle_b",
        KeyStrategy::Sequential,
        &[
            FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
            FieldInfo::new("a", "a_id", SqlType::BigInt).foreign_key("cycle_a.id"),
        ],
        &[]
    );

    #[test]
    fn test_register_and_lookup() {
        let mut registry = MappingRegistry::new();
        registry.register::<Country>().unwrap();
        registry.register::<Office>().unwrap();

        let office = TypeId::of::<Office>();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.table_for(office), Some("offices"));
        assert_eq!(
            registry.columns_for(office),
            Some(vec!["id", "country_id"])
        );
        assert_eq!(
            registry.key_strategy_for(office),
            Some(KeyStrategy::Sequential)
        );
        assert_eq!(registry.associations_for(office).len(), 1);
        assert!(registry.descriptor_for_table("countries").is_some());
    }

    #[test]
    fn test_rejects_invalid_mappings() {
        let mut registry = MappingRegistry::new();
        assert!(matches!(
            registry.register::<NoKey>(),
            Err(Error::Mapping(_))
        ));
        assert!(registry.register::<BadTable>().is_err());
        assert!(registry.register::<TextSequence>().is_err());

        registry.register::<Country>().unwrap();
        assert!(registry.register::<Country>().is_err());
    }

    #[test]
    fn test_unregistered_descriptor_is_mapping_error() {
        let registry = MappingRegistry::new();
        let err = registry.descriptor::<Country>().unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }

    #[test]
    fn test_creation_order_parents_first() {
        let registry = MappingRegistry::new()
            .with::<Desk>()
            .unwrap()
            .with::<Office>()
            .unwrap()
            .with::<Country>()
            .unwrap();

        assert_eq!(
            registry.creation_order().unwrap(),
            vec!["countries", "offices", "desks"]
        );
        let deps = registry.table_dependencies();
        assert!(deps["offices"].contains("countries"));
        assert!(deps["countries"].is_empty());
    }

    #[test]
    fn test_creation_order_detects_cycle() {
        let registry = MappingRegistry::new()
            .with::<CycleA>()
            .unwrap()
            .with::<CycleB>()
            .unwrap();
        assert!(matches!(
            registry.creation_order(),
            Err(Error::Mapping(_))
        ));
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("offices"));
        assert!(is_valid_identifier("_x1"));
        assert!(!is_valid_identifier("1x"));
        assert!(!is_valid_identifier("a;drop"));
        assert!(!is_valid_identifier(""));
    }
}
