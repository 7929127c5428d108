//! Type-erased store for external collaborator handles.
//!
//! Database pools, cache clients, and similar collaborators are built by
//! the process bootstrap, stored here keyed by their concrete type, and
//! handed by reference into operation and subsystem init hooks. The core
//! never calls into the stored values itself, and nothing lives in a
//! process-wide registry: the store is plain state owned by the server.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

/// Holds one collaborator handle per concrete type.
#[derive(Clone, Default)]
pub struct ServerResources {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServerResources {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Store `value`, replacing any existing handle of the same type.
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.values
            .insert(TypeId::of::<T>(), Arc::new(value) as Arc<dyn Any + Send + Sync>);
    }

    /// Retrieve the handle of type `T`, if one was stored.
    #[must_use]
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }

    /// Whether a handle of type `T` was stored.
    #[must_use]
    pub fn contains<T>(&self) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.values.contains_key(&TypeId::of::<T>())
    }
}
