//! Plugin registry: instantiates declared backends, configures each one with
//! its settings slice, and resolves identifiers to exactly one backend.
//!
//! The registry is built fresh for every launch and is read-only afterwards.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::backend::{self, Backend, BackendDescriptor, BackendSettings, Priority};
use crate::config::PluginDeclaration;
use crate::error::{ConfigError, ResolveError};

/// Constructs an unconfigured backend under the given instance name
pub type BackendFactory = fn(&str) -> Box<dyn Backend>;

/// Compiled-in strategy table mapping a backend kind to its constructor
#[derive(Clone)]
pub struct StrategyTable {
    factories: BTreeMap<String, BackendFactory>,
}

impl StrategyTable {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Every backend shipped with the launcher
    pub fn builtin() -> Self {
        Self::empty()
            .with(backend::local::KIND, |name| Box::new(backend::local::LocalBackend::new(name)))
            .with(backend::http::KIND, |name| Box::new(backend::http::HttpBackend::new(name)))
            .with(backend::s3::KIND, |name| Box::new(backend::s3::S3Backend::new(name)))
            .with(backend::dcc::KIND, |name| Box::new(backend::dcc::DccStorageBackend::new(name)))
    }

    /// Add or replace the factory for `kind`
    pub fn with(mut self, kind: &str, factory: BackendFactory) -> Self {
        self.factories.insert(kind.to_string(), factory);
        self
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    fn get(&self, kind: &str) -> Option<BackendFactory> {
        self.factories.get(kind).copied()
    }
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// A declared backend that could not be enabled
#[derive(Debug, Clone, Serialize)]
pub struct DisabledBackend {
    pub name: String,
    pub kind: String,
    pub reason: String,
}

/// Outcome of loading the plugin manifest
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationResult {
    /// In resolution order
    pub enabled: Vec<BackendDescriptor>,
    pub disabled: Vec<DisabledBackend>,
}

pub struct PluginRegistry {
    /// Sorted by priority; declaration order within a priority class
    backends: Vec<Arc<dyn Backend>>,
    disabled: Vec<DisabledBackend>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
            disabled: Vec::new(),
        }
    }

    /// Load the compiled-in backends named by `plugins`
    pub fn load_all(
        plugins: &[PluginDeclaration],
        settings: &BTreeMap<String, BackendSettings>,
    ) -> Self {
        Self::load_all_with(&StrategyTable::builtin(), plugins, settings)
    }

    /// Load backends from an explicit strategy table. An empty plugin list
    /// declares every kind in the table once, under its kind name.
    pub fn load_all_with(
        table: &StrategyTable,
        plugins: &[PluginDeclaration],
        settings: &BTreeMap<String, BackendSettings>,
    ) -> Self {
        let declarations: Vec<PluginDeclaration> = if plugins.is_empty() {
            table.kinds().map(PluginDeclaration::for_kind).collect()
        } else {
            plugins.to_vec()
        };

        let empty = BackendSettings::new();
        let mut registry = Self::new();
        let mut seen = BTreeSet::new();

        for declaration in &declarations {
            let kind = declaration.kind().to_string();

            if !seen.insert(declaration.name.clone()) {
                registry.disable(
                    &declaration.name,
                    &kind,
                    ConfigError::DuplicateName(declaration.name.clone()),
                );
                continue;
            }

            let Some(factory) = table.get(&kind) else {
                registry.disable(
                    &declaration.name,
                    &kind,
                    ConfigError::UnknownKind {
                        name: declaration.name.clone(),
                        kind: kind.clone(),
                    },
                );
                continue;
            };

            let slice = settings.get(&declaration.name).unwrap_or(&empty);

            if let Some(key) = declaration
                .required_keys
                .iter()
                .find(|key| slice.get(*key).map_or(true, |v| v.is_empty()))
            {
                registry.disable(
                    &declaration.name,
                    &kind,
                    ConfigError::MissingKey {
                        backend: declaration.name.clone(),
                        key: key.clone(),
                    },
                );
                continue;
            }

            if let Err(err) = registry.register(factory(&declaration.name), slice) {
                registry.disable(&declaration.name, &kind, err);
            }
        }

        let unused: Vec<&String> = settings.keys().filter(|name| !seen.contains(*name)).collect();
        if !unused.is_empty() {
            tracing::warn!("Settings given for undeclared backends: {:?}", unused);
        }

        registry
    }

    /// Configure `backend` once and make it available for resolution
    pub fn register(
        &mut self,
        mut backend: Box<dyn Backend>,
        settings: &BackendSettings,
    ) -> Result<(), ConfigError> {
        backend.configure(settings)?;

        let descriptor = backend.descriptor();
        tracing::info!(
            backend = %descriptor.name,
            kind = %descriptor.kind,
            "Enabled backend for {}",
            descriptor.handles
        );

        let backend: Arc<dyn Backend> = Arc::from(backend);
        let position = self
            .backends
            .iter()
            .position(|existing| existing.descriptor().priority > backend.descriptor().priority)
            .unwrap_or(self.backends.len());
        self.backends.insert(position, backend);
        Ok(())
    }

    fn disable(&mut self, name: &str, kind: &str, reason: ConfigError) {
        tracing::warn!(backend = %name, "Backend disabled: {}", reason);
        self.disabled.push(DisabledBackend {
            name: name.to_string(),
            kind: kind.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Find the single backend responsible for `identifier`.
    ///
    /// Explicit backends are probed first and must not overlap; the fallback
    /// class answers only when no explicit backend claims the identifier.
    pub fn resolve(&self, identifier: &str) -> Result<Arc<dyn Backend>, ResolveError> {
        let explicit: Vec<&Arc<dyn Backend>> = self
            .backends
            .iter()
            .filter(|b| b.descriptor().priority == Priority::Explicit && b.claims(identifier))
            .collect();

        match explicit.as_slice() {
            [only] => return Ok(Arc::clone(only)),
            [] => {}
            many => {
                return Err(ResolveError::Ambiguous {
                    identifier: identifier.to_string(),
                    backends: many.iter().map(|b| b.descriptor().name.clone()).collect(),
                })
            }
        }

        self.backends
            .iter()
            .filter(|b| b.descriptor().priority == Priority::Fallback)
            .find(|b| b.claims(identifier))
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(identifier.to_string()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.backends.iter().map(|b| b.descriptor())
    }

    pub fn disabled(&self) -> &[DisabledBackend] {
        &self.disabled
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn describe(&self) -> RegistrationResult {
        RegistrationResult {
            enabled: self.enabled().cloned().collect(),
            disabled: self.disabled.clone(),
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
