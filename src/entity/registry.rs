use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use tracing::debug;

use super::{Entity, EntityMetadata};
use crate::core::{Error, Result};

lazy_static! {
    static ref GLOBAL_REGISTRY: EntityRegistry = EntityRegistry::new();
}

type Slot = Arc<dyn Any + Send + Sync>;

/// Memoizes [`EntityMetadata`] per entity type.
///
/// Metadata is built at most once per type and never invalidated.
#[derive(Default)]
pub struct EntityRegistry {
    entries: RwLock<HashMap<TypeId, Slot>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static EntityRegistry {
        &GLOBAL_REGISTRY
    }

    pub fn fields_for<T: Entity>(&self) -> Result<Arc<EntityMetadata<T>>> {
        let type_id = TypeId::of::<T>();

        if let Some(slot) = self.entries.read()?.get(&type_id) {
            return downcast::<T>(Arc::clone(slot));
        }

        let mut entries = self.entries.write()?;
        // Another caller may have built it while we waited for the lock
        if let Some(slot) = entries.get(&type_id) {
            return downcast::<T>(Arc::clone(slot));
        }

        let metadata = Arc::new(EntityMetadata::<T>::describe()?);
        debug!(entity = T::entity_name(), fields = metadata.len(), "Built entity metadata");
        entries.insert(type_id, metadata.clone() as Slot);
        Ok(metadata)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn downcast<T: Entity>(slot: Slot) -> Result<Arc<EntityMetadata<T>>> {
    slot.downcast::<EntityMetadata<T>>().map_err(|_| {
        Error::Configuration(format!(
            "metadata registered for {} has the wrong type",
            T::entity_name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityBuilder;
    use std::thread;

    #[derive(Debug, Default)]
    struct Counter {
        hits: i32,
    }

    impl Entity for Counter {
        fn describe(builder: &mut EntityBuilder<Self>) {
            builder.field("hits", |e: &Counter| &e.hits, |e: &mut Counter| &mut e.hits);
        }
    }

    #[test]
    fn test_metadata_is_memoized() {
        let registry = EntityRegistry::new();
        let first = registry.fields_for::<Counter>().unwrap();
        let second = registry.fields_for::<Counter>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_first_access_builds_once() {
        let registry = Arc::new(EntityRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.fields_for::<Counter>().unwrap())
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for metadata in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], metadata));
        }
    }
}
