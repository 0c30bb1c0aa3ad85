//! Registered functions.
//!
//! A function is a named piece of code bound to a route, stored so it can be
//! executed repeatedly and its metrics tracked over time.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::request::Language;

/// A stored function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub id: i64,
    pub name: String,
    pub route: String,
    pub code: String,
    pub language: Language,
    pub timeout_ms: u64,
}

/// Fields supplied when creating or replacing a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFunction {
    pub name: String,
    pub route: String,
    pub code: String,
    pub language: Language,
    pub timeout_ms: u64,
}

impl NewFunction {
    fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::Invalid("name must not be empty".into()));
        }
        if !self.route.starts_with('/') {
            return Err(RegistryError::Invalid(format!(
                "route '{}' must start with '/'",
                self.route
            )));
        }
        if self.timeout_ms == 0 {
            return Err(RegistryError::Invalid("timeout_ms must be positive".into()));
        }
        Ok(())
    }

    fn into_record(self, id: i64) -> FunctionRecord {
        FunctionRecord {
            id,
            name: self.name,
            route: self.route,
            code: self.code,
            language: self.language,
            timeout_ms: self.timeout_ms,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("function {0} not found")]
    NotFound(i64),

    #[error("route '{0}' is already taken")]
    DuplicateRoute(String),

    #[error("invalid function: {0}")]
    Invalid(String),
}

/// Trait for function stores.
#[async_trait]
pub trait FunctionRegistry: Send + Sync {
    async fn create(&self, function: NewFunction) -> Result<FunctionRecord, RegistryError>;

    async fn get(&self, id: i64) -> Result<FunctionRecord, RegistryError>;

    /// Replace every field of an existing function.
    async fn update(&self, id: i64, function: NewFunction)
        -> Result<FunctionRecord, RegistryError>;

    async fn delete(&self, id: i64) -> Result<(), RegistryError>;

    /// All functions, ordered by id.
    async fn list(&self) -> Vec<FunctionRecord>;
}

#[derive(Debug, Default)]
struct Inner {
    last_id: i64,
    functions: BTreeMap<i64, FunctionRecord>,
}

impl Inner {
    fn route_taken(&self, route: &str, except: Option<i64>) -> bool {
        self.functions
            .values()
            .any(|f| f.route == route && Some(f.id) != except)
    }
}

/// Process-local registry.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    inner: RwLock<Inner>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FunctionRegistry for InMemoryRegistry {
    async fn create(&self, function: NewFunction) -> Result<FunctionRecord, RegistryError> {
        function.validate()?;
        let mut inner = self.inner.write().await;
        if inner.route_taken(&function.route, None) {
            return Err(RegistryError::DuplicateRoute(function.route));
        }

        inner.last_id += 1;
        let record = function.into_record(inner.last_id);
        inner.functions.insert(record.id, record.clone());
        debug!(id = record.id, route = %record.route, "Function registered");
        Ok(record)
    }

    async fn get(&self, id: i64) -> Result<FunctionRecord, RegistryError> {
        self.inner
            .read()
            .await
            .functions
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    async fn update(
        &self,
        id: i64,
        function: NewFunction,
    ) -> Result<FunctionRecord, RegistryError> {
        function.validate()?;
        let mut inner = self.inner.write().await;
        if !inner.functions.contains_key(&id) {
            return Err(RegistryError::NotFound(id));
        }
        if inner.route_taken(&function.route, Some(id)) {
            return Err(RegistryError::DuplicateRoute(function.route));
        }

        let record = function.into_record(id);
        inner.functions.insert(id, record.clone());
        Ok(record)
    }

    async fn delete(&self, id: i64) -> Result<(), RegistryError> {
        self.inner
            .write()
            .await
            .functions
            .remove(&id)
            .map(|_| ())
            .ok_or(RegistryError::NotFound(id))
    }

    async fn list(&self) -> Vec<FunctionRecord> {
        self.inner.read().await.functions.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(route: &str) -> NewFunction {
        NewFunction {
            name: "hello".into(),
            route: route.into(),
            code: "print('hi')".into(),
            language: Language::Python,
            timeout_ms: 5000,
        }
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_never_reused() {
        let registry = InMemoryRegistry::new();
        let a = registry.create(function("/a")).await.unwrap();
        let b = registry.create(function("/b")).await.unwrap();
        registry.delete(b.id).await.unwrap();
        let c = registry.create(function("/c")).await.unwrap();

        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(c.id, 3);
        let ids: Vec<i64> = registry.list().await.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn routes_are_unique() {
        let registry = InMemoryRegistry::new();
        let a = registry.create(function("/a")).await.unwrap();
        registry.create(function("/b")).await.unwrap();

        assert_eq!(
            registry.create(function("/a")).await,
            Err(RegistryError::DuplicateRoute("/a".into()))
        );
        assert_eq!(
            registry.update(a.id, function("/b")).await,
            Err(RegistryError::DuplicateRoute("/b".into()))
        );
        // Keeping its own route is fine.
        assert!(registry.update(a.id, function("/a")).await.is_ok());
    }

    #[tokio::test]
    async fn update_replaces_fields() {
        let registry = InMemoryRegistry::new();
        let a = registry.create(function("/a")).await.unwrap();

        let mut changed = function("/renamed");
        changed.language = Language::Javascript;
        changed.code = "console.log('hi')".into();
        let updated = registry.update(a.id, changed).await.unwrap();

        assert_eq!(updated.id, a.id);
        assert_eq!(registry.get(a.id).await.unwrap(), updated);
        assert_eq!(updated.language, Language::Javascript);
    }

    #[tokio::test]
    async fn missing_ids_are_reported() {
        let registry = InMemoryRegistry::new();
        assert_eq!(registry.get(7).await, Err(RegistryError::NotFound(7)));
        assert_eq!(registry.delete(7).await, Err(RegistryError::NotFound(7)));
        assert_eq!(
            registry.update(7, function("/a")).await,
            Err(RegistryError::NotFound(7))
        );
    }

    #[tokio::test]
    async fn invalid_functions_are_rejected() {
        let registry = InMemoryRegistry::new();
        assert!(matches!(
            registry.create(function("no-slash")).await,
            Err(RegistryError::Invalid(_))
        ));

        let mut zero = function("/z");
        zero.timeout_ms = 0;
        assert!(matches!(
            registry.create(zero).await,
            Err(RegistryError::Invalid(_))
        ));
        assert!(registry.list().await.is_empty());
    }
}
