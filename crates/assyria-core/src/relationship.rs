//! Association metadata and association holders.
//!
//! Associations are bidirectional: the many-to-one side owns the foreign
//! key column and writes it, the one-to-many side is an inverse navigation
//! collection that never generates writes of its own.

use crate::entity::{Entity, EntityRef, ErasedRef, WeakEntityRef};
use crate::value::Value;
use std::fmt;

/// The cardinality of an association, seen from the declaring entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    /// Many-to-one: the declaring entity holds the foreign key.
    ManyToOne,
    /// One-to-many: the related entities hold the foreign key.
    OneToMany,
}

/// Which operations propagate from the declaring entity to its associated
/// entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cascade {
    /// save, persist, update and save-or-update (and the flush-time closure)
    pub save_update: bool,
    /// delete
    pub delete: bool,
}

impl Cascade {
    pub const NONE: Cascade = Cascade {
        save_update: false,
        delete: false,
    };
    pub const SAVE_UPDATE: Cascade = Cascade {
        save_update: true,
        delete: false,
    };
    pub const DELETE: Cascade = Cascade {
        save_update: false,
        delete: true,
    };
    pub const ALL: Cascade = Cascade {
        save_update: true,
        delete: true,
    };

    pub const fn is_none(&self) -> bool {
        !self.save_update && !self.delete
    }
}

/// Static description of one association of an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationInfo {
    /// Attribute name on the declaring entity
    pub name: &'static str,
    /// Table of the associated entity type
    pub target_table: &'static str,
    /// Cardinality
    pub kind: AssociationKind,
    /// Foreign key column (on the declaring table for many-to-one, on the
    /// target table for one-to-many)
    pub column: &'static str,
    /// Cascade rules
    pub cascade: Cascade,
    /// Inverse side: navigation only, never writes the foreign key
    pub inverse: bool,
}

impl AssociationInfo {
    /// Declare an owning many-to-one reference.
    pub const fn many_to_one(
        name: &'static str,
        target_table: &'static str,
        column: &'static str,
    ) -> Self {
        Self {
            name,
            target_table,
            kind: AssociationKind::ManyToOne,
            column,
            cascade: Cascade::NONE,
            inverse: false,
        }
    }

    /// Declare a one-to-many collection.
    pub const fn one_to_many(
        name: &'static str,
        target_table: &'static str,
        column: &'static str,
    ) -> Self {
        Self {
            name,
            target_table,
            kind: AssociationKind::OneToMany,
            column,
            cascade: Cascade::NONE,
            inverse: false,
        }
    }

    /// Set cascade rules.
    pub const fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    /// Mark as the inverse (non-owning) side.
    pub const fn inverse(mut self) -> Self {
        self.inverse = true;
        self
    }

    /// Does this side persist the foreign key?
    pub const fn is_owning(&self) -> bool {
        matches!(self.kind, AssociationKind::ManyToOne) && !self.inverse
    }
}

/// A many-to-one reference.
///
/// Holds a weak handle so a parent that keeps its children in a
/// [`RelatedMany`] does not form a reference cycle. The foreign key is read
/// from the target's *current* key when the row is written, so a child
/// attached to a parent that has not been saved yet picks up the parent's
/// key once it is assigned.
pub struct Related<T: Entity> {
    target: Option<WeakEntityRef<T>>,
    fk_value: Value,
}

impl<T: Entity> Related<T> {
    /// No reference (NULL foreign key).
    pub const fn empty() -> Self {
        Self {
            target: None,
            fk_value: Value::Null,
        }
    }

    /// Reference an in-memory instance.
    pub fn to(target: &EntityRef<T>) -> Self {
        Self {
            target: Some(target.downgrade()),
            fk_value: target.key(),
        }
    }

    /// Reference by foreign key only (as loaded from a row).
    pub fn from_fk(fk: impl Into<Value>) -> Self {
        Self {
            target: None,
            fk_value: fk.into(),
        }
    }

    /// Point at another instance.
    pub fn set(&mut self, target: &EntityRef<T>) {
        *self = Self::to(target);
    }

    /// Drop the reference.
    pub fn clear(&mut self) {
        *self = Self::empty();
    }

    /// The referenced instance, if it is held in memory and still alive.
    pub fn get(&self) -> Option<EntityRef<T>> {
        self.target.as_ref().and_then(EntityRef::upgrade)
    }

    /// The foreign key value to write.
    pub fn fk(&self) -> Value {
        match self.get() {
            Some(target) => {
                let key = target.key();
                if key.is_unset_key() { Value::Null } else { key }
            }
            None => self.fk_value.clone(),
        }
    }

    /// Is there no reference at all?
    pub fn is_empty(&self) -> bool {
        self.get().is_none() && self.fk_value.is_null()
    }

    /// Erased handle of the in-memory target, for cascades and reference
    /// checks.
    pub fn erased(&self) -> Option<ErasedRef> {
        self.get().map(|target| target.erased())
    }
}

impl<T: Entity> Default for Related<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Entity> Clone for Related<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            fk_value: self.fk_value.clone(),
        }
    }
}

impl<T: Entity> fmt::Debug for Related<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.get().is_some() {
            "in-memory"
        } else if self.fk_value.is_null() {
            "empty"
        } else {
            "by-key"
        };
        f.debug_struct("Related")
            .field("state", &state)
            .field("fk", &self.fk())
            .finish()
    }
}

/// An inverse one-to-many collection of strong handles.
pub struct RelatedMany<T: Entity> {
    items: Vec<EntityRef<T>>,
}

impl<T: Entity> RelatedMany<T> {
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(&mut self, item: EntityRef<T>) {
        self.items.push(item);
    }

    /// Remove an instance (by identity). Returns whether it was present.
    pub fn remove(&mut self, item: &EntityRef<T>) -> bool {
        let before = self.items.len();
        self.items.retain(|existing| !existing.ptr_eq(item));
        before != self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRef<T>> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Erased handles of every member.
    pub fn erased(&self) -> Vec<ErasedRef> {
        self.items.iter().map(EntityRef::erased).collect()
    }
}

impl<T: Entity> Default for RelatedMany<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Clone for RelatedMany<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T: Entity> fmt::Debug for RelatedMany<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelatedMany")
            .field("len", &self.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::KeyStrategy;
    use crate::field::FieldInfo;
    use crate::row::{FromValue, Row};
    use crate::types::SqlType;

    #[derive(Debug, Clone)]
    struct Team {
        id: i64,
    }

    impl Entity for Team {
        const TABLE_NAME: &'static str = "teams";
        const KEY_COLUMN: &'static str = "id";
        const KEY_STRATEGY: KeyStrategy = KeyStrategy::Sequential;

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: &[FieldInfo] =
                &[FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true)];
            FIELDS
        }

        fn key(&self) -> Value {
            Value::BigInt(self.id)
        }

        fn set_key(&mut self, key: Value) -> crate::Result<()> {
            self.id = Option::<i64>::from_value(&key)?.unwrap_or(0);
            Ok(())
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            Vec::new()
        }

        fn from_row(row: &Row) -> crate::Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
            })
        }
    }

    #[test]
    fn test_related_fk_follows_target_key() {
        let team = EntityRef::new(Team { id: 0 });
        let related = Related::to(&team);

        assert_eq!(related.fk(), Value::Null);
        team.write().id = 5;
        assert_eq!(related.fk(), Value::BigInt(5));
        assert!(!related.is_empty());
    }

    #[test]
    fn test_related_falls_back_to_cached_fk() {
        let related: Related<Team> = Related::from_fk(9_i64);
        assert!(related.get().is_none());
        assert_eq!(related.fk(), Value::BigInt(9));

        let empty: Related<Team> = Related::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.fk(), Value::Null);
    }

    #[test]
    fn test_related_many_identity_removal() {
        let a = EntityRef::new(Team { id: 1 });
        let b = EntityRef::new(Team { id: 1 });
        let mut many = RelatedMany::new();
        many.push(a.clone());
        many.push(b.clone());

        assert!(many.remove(&a));
        assert!(!many.remove(&a));
        assert_eq!(many.len(), 1);
        assert!(many.iter().next().unwrap().ptr_eq(&b));
    }

    #[test]
    fn test_association_builders() {
        const OFFICES: AssociationInfo = AssociationInfo::one_to_many("offices", "offices", "country_id")
            .inverse()
            .cascade(Cascade::SAVE_UPDATE);
        const COUNTRY: AssociationInfo =
            AssociationInfo::many_to_one("country", "countries", "country_id");

        assert!(!OFFICES.is_owning());
        assert!(OFFICES.cascade.save_update);
        assert!(!OFFICES.cascade.delete);
        assert!(COUNTRY.is_owning());
        assert!(COUNTRY.cascade.is_none());
    }
}
