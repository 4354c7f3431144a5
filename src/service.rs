//! Service and method descriptors.
//!
//! A connection names its service once, in the connection header; every call
//! then names a method of that service. The engine resolves both against a
//! [`ServiceRegistry`] built at startup. An unknown service ends the
//! connection, an unknown method only fails the call.

use std::collections::HashMap;
use std::sync::Arc;

/// One callable method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    service: String,
    name: String,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning service.
    pub fn service(&self) -> &str {
        &self.service
    }
}

/// A named set of methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl ServiceDescriptor {
    /// Create a service with no methods.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Add a method (builder style).
    pub fn with_method(mut self, name: impl Into<String>) -> Self {
        self.add_method(name);
        self
    }

    /// Add a method. Re-adding an existing name is a no-op.
    pub fn add_method(&mut self, name: impl Into<String>) {
        let name = name.into();
        let service = self.name.clone();
        self.methods
            .entry(name.clone())
            .or_insert_with(|| Arc::new(MethodDescriptor { service, name }));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Option<Arc<MethodDescriptor>> {
        self.methods.get(name).cloned()
    }

    /// Method names, unordered.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

/// All services a server exposes.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceDescriptor>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a service.
    pub fn register(&mut self, service: ServiceDescriptor) {
        self.services
            .insert(service.name.clone(), Arc::new(service));
    }

    /// Add `method` to `service`, creating the service if needed.
    pub fn add_method(&mut self, service: &str, method: &str) {
        let entry = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(ServiceDescriptor::new(service)));
        Arc::make_mut(entry).add_method(method);
    }

    /// Look up a service by name.
    pub fn get(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let mut registry = ServiceRegistry::new();
        registry.register(ServiceDescriptor::new("Kv").with_method("get").with_method("put"));

        let service = registry.get("Kv").unwrap();
        let method = service.method("get").unwrap();
        assert_eq!(method.name(), "get");
        assert_eq!(method.service(), "Kv");
        assert!(service.method("scan").is_none());
        assert!(registry.get("Admin").is_none());
    }

    #[test]
    fn test_add_method_creates_service() {
        let mut registry = ServiceRegistry::new();
        registry.add_method("Admin", "balance");
        registry.add_method("Admin", "flush");

        let service = registry.get("Admin").unwrap();
        let mut names: Vec<_> = service.method_names().collect();
        names.sort();
        assert_eq!(names, vec!["balance", "flush"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_method_descriptor_shared() {
        let service = ServiceDescriptor::new("Kv").with_method("get");
        let a = service.method("get").unwrap();
        let b = service.method("get").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
