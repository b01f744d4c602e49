//! Entity metadata.
//!
//! An entity type declares its mapped columns once through
//! [`Entity::describe`] (or `#[derive(Entity)]`). The resulting
//! [`EntityMetadata`] is built lazily and memoized by an
//! [`EntityRegistry`].

pub mod builder;
pub mod field;
pub mod registry;

use std::collections::BTreeMap;

use crate::core::Result;

pub use builder::{EntityBuilder, FieldOptions};
pub use field::{Access, FieldDef, FieldValue};
pub use registry::EntityRegistry;

/// A type whose values can be mapped to and from table rows.
pub trait Entity: Default + Send + 'static {
    fn describe(builder: &mut EntityBuilder<Self>);

    /// Name used in error messages. Defaults to the bare type name.
    fn entity_name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

/// The mapped fields of `T`, keyed and ordered by lowercase column key.
pub struct EntityMetadata<T> {
    name: &'static str,
    fields: BTreeMap<String, FieldDef<T>>,
}

impl<T: Entity> EntityMetadata<T> {
    /// Build the metadata of `T` without consulting a registry.
    pub fn describe() -> Result<Self> {
        let mut builder = EntityBuilder::new();
        T::describe(&mut builder);
        builder.build()
    }
}

impl<T> EntityMetadata<T> {
    pub(crate) fn new(name: &'static str, fields: BTreeMap<String, FieldDef<T>>) -> Self {
        Self { name, fields }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Look up a field by column key, ignoring case.
    pub fn get(&self, key: &str) -> Option<&FieldDef<T>> {
        match self.fields.get(key) {
            Some(def) => Some(def),
            None => self.fields.get(&key.to_lowercase()),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDef<T>> {
        self.fields.values()
    }

    pub fn primary_keys(&self) -> impl Iterator<Item = &FieldDef<T>> {
        self.fields.values().filter(|def| def.is_primary_key())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub(crate) fn into_fields(self) -> impl Iterator<Item = FieldDef<T>> {
        self.fields.into_values()
    }
}

impl<T> std::fmt::Debug for EntityMetadata<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Dept {
        id: i64,
        name: Option<String>,
    }

    impl Entity for Dept {
        fn describe(builder: &mut EntityBuilder<Self>) {
            builder.field("id", |e: &Dept| &e.id, |e: &mut Dept| &mut e.id).primary_key();
            builder.field("name", |e: &Dept| &e.name, |e: &mut Dept| &mut e.name);
        }
    }

    #[test]
    fn test_default_entity_name() {
        assert_eq!(Dept::entity_name(), "Dept");
    }

    #[test]
    fn test_lookup_ignores_case() {
        let meta = EntityMetadata::<Dept>::describe().unwrap();
        assert!(meta.contains("NAME"));
        assert!(meta.get("Name").unwrap().is_nullable());
        assert_eq!(meta.primary_keys().map(|def| def.key()).collect::<Vec<_>>(), vec!["id"]);
        assert_eq!(meta.len(), 2);
    }
}
