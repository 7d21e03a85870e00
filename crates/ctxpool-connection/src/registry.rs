//! Registry of pooled services and the factories that build them

use std::collections::HashMap;
use std::sync::Arc;

use ctxpool_core::{InstanceFactory, PoolingError, Result, ServiceId};
use parking_lot::RwLock;

/// Decides from a service id alone whether the service is pooled
pub trait ServiceClassifier: Send + Sync {
    /// Whether this classifier claims `service`, without building anything
    fn claims(&self, service: &ServiceId) -> bool;

    /// Return a factory for `service` if this classifier claims it
    fn classify(&self, service: &ServiceId) -> Option<Arc<dyn InstanceFactory>>;
}

type FactoryBuilder = dyn Fn(&ServiceId) -> Arc<dyn InstanceFactory> + Send + Sync;

/// Claims every service whose id starts with `prefix` and ends with `suffix`
///
/// e.g. prefix `db.` and suffix `_connection` claims `db.orders_connection`.
pub struct PatternClassifier {
    prefix: String,
    suffix: String,
    builder: Box<FactoryBuilder>,
}

impl PatternClassifier {
    pub fn new(
        prefix: impl Into<String>,
        suffix: impl Into<String>,
        builder: impl Fn(&ServiceId) -> Arc<dyn InstanceFactory> + Send + Sync + 'static,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            builder: Box::new(builder),
        }
    }

    pub fn matches(&self, service: &ServiceId) -> bool {
        let id = service.as_str();
        id.len() >= self.prefix.len() + self.suffix.len()
            && id.starts_with(&self.prefix)
            && id.ends_with(&self.suffix)
    }
}

impl ServiceClassifier for PatternClassifier {
    fn claims(&self, service: &ServiceId) -> bool {
        self.matches(service)
    }

    fn classify(&self, service: &ServiceId) -> Option<Arc<dyn InstanceFactory>> {
        self.matches(service).then(|| (self.builder)(service))
    }
}

/// Registry of pooled services
///
/// Explicit registrations take precedence over classifiers; classifiers are
/// consulted in registration order and the first factory one produces for a
/// service is kept for the life of the registry.
pub struct ServiceRegistry {
    factories: RwLock<HashMap<ServiceId, Arc<dyn InstanceFactory>>>,
    classifiers: RwLock<Vec<Arc<dyn ServiceClassifier>>>,
    classified: RwLock<HashMap<ServiceId, Arc<dyn InstanceFactory>>>,
}

impl ServiceRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            classifiers: RwLock::new(Vec::new()),
            classified: RwLock::new(HashMap::new()),
        }
    }

    /// Register the factory for a service. A later registration replaces it.
    pub fn register(&self, service: impl Into<ServiceId>, factory: impl InstanceFactory) {
        self.register_shared(service, Arc::new(factory));
    }

    /// Register an already shared factory
    pub fn register_shared(&self, service: impl Into<ServiceId>, factory: Arc<dyn InstanceFactory>) {
        let service = service.into();
        tracing::info!(service = %service, "registering pooled service");
        self.factories.write().insert(service, factory);
    }

    /// Add a classifier, consulted after every earlier one
    pub fn register_classifier(&self, classifier: impl ServiceClassifier + 'static) {
        self.classifiers.write().push(Arc::new(classifier));
    }

    /// Find the factory for a service
    pub fn resolve(&self, service: &ServiceId) -> Result<Arc<dyn InstanceFactory>> {
        if let Some(factory) = self.factories.read().get(service) {
            return Ok(factory.clone());
        }
        if let Some(factory) = self.classified.read().get(service) {
            return Ok(factory.clone());
        }

        let classifiers = self.classifiers.read().clone();
        for classifier in classifiers {
            if let Some(factory) = classifier.classify(service) {
                let mut classified = self.classified.write();
                let factory = classified.entry(service.clone()).or_insert(factory).clone();
                tracing::debug!(service = %service, "classified pooled service");
                return Ok(factory);
            }
        }

        tracing::warn!(service = %service, "service not found in registry");
        Err(PoolingError::ServiceNotFound(service.clone()))
    }

    /// Whether acquiring `service` would go through a pool
    pub fn is_pooled(&self, service: &ServiceId) -> bool {
        self.factories.read().contains_key(service)
            || self.classified.read().contains_key(service)
            || self
                .classifiers
                .read()
                .iter()
                .any(|classifier| classifier.claims(service))
    }

    /// Explicitly registered service ids, sorted
    pub fn list(&self) -> Vec<ServiceId> {
        let mut services: Vec<_> = self.factories.read().keys().cloned().collect();
        services.sort();
        services
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
