//! Testing utilities for users of the kiln library.
//!
//! In-memory doubles for the engine's collaborators:
//!
//! - [`ArtifactStore`] / [`InMemoryProduct`]: products backed by a shared
//!   in-memory key set instead of real storage
//! - [`TouchRunner`], [`NoopRunner`], [`FailingRunner`], [`StoppingRunner`]:
//!   canned run capabilities
//! - [`NamedClient`]: a client that only carries a name

use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::client::Client;
use crate::core::params::Params;
use crate::core::product::{Metadata, Product, ProductError};
use crate::core::source::{Source, SourceError, TemplatedSource};
use crate::core::task::{GracefulStop, RunContext, RunError, Runner};
use crate::core::template;

/// Shared in-memory "storage": a set of artifact keys that exist.
///
/// Clone freely; all clones see the same artifacts.
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an artifact as existing.
    pub fn create(&self, key: &str) {
        self.keys.lock().expect("store lock").insert(key.to_string());
    }

    /// Remove an artifact.
    pub fn remove(&self, key: &str) {
        self.keys.lock().expect("store lock").remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().expect("store lock").contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().expect("store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A product identified by a (possibly templated) string key in an
/// [`ArtifactStore`].
#[derive(Debug)]
pub struct InMemoryProduct {
    key_template: String,
    rendered: Option<String>,
    store: ArtifactStore,
    metadata: Metadata,
    client: Option<Arc<NamedClient>>,
    uploads: Arc<AtomicU32>,
    downloads: Arc<AtomicU32>,
}

impl InMemoryProduct {
    /// Create a product with its own private store.
    pub fn new(key_template: impl Into<String>) -> Self {
        Self::with_store(key_template, ArtifactStore::new())
    }

    /// Create a product sharing an existing store.
    pub fn with_store(key_template: impl Into<String>, store: ArtifactStore) -> Self {
        Self {
            key_template: key_template.into(),
            rendered: None,
            store,
            metadata: Metadata::default(),
            client: None,
            uploads: Arc::new(AtomicU32::new(0)),
            downloads: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_client(mut self, client: Arc<NamedClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Shared upload counter; clone before boxing the product.
    pub fn upload_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.uploads)
    }

    /// Shared download counter; clone before boxing the product.
    pub fn download_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.downloads)
    }

    /// The current key: rendered if available, otherwise the raw template.
    fn key(&self) -> &str {
        self.rendered.as_deref().unwrap_or(&self.key_template)
    }
}

impl Product for InMemoryProduct {
    fn render(&mut self, params: &Params) -> Result<(), ProductError> {
        let rendered = template::render_partial(&self.key_template, params)?;
        self.rendered = Some(rendered);
        Ok(())
    }

    fn identity(&self) -> Result<Value, ProductError> {
        Ok(Value::String(self.key().to_string()))
    }

    fn restore_identity(&mut self, identity: &Value) -> Result<(), ProductError> {
        if let Value::String(key) = identity {
            self.rendered = Some(key.clone());
        }
        Ok(())
    }

    fn exists(&self) -> Result<bool, ProductError> {
        Ok(self.store.contains(self.key()))
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn download(&mut self) -> Result<(), ProductError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn upload(&mut self) -> Result<(), ProductError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn client(&self) -> Option<&dyn Client> {
        self.client.as_deref().map(|c| c as &dyn Client)
    }

    fn kind(&self) -> &'static str {
        "in_memory"
    }
}

/// A client that only carries a name.
#[derive(Debug)]
pub struct NamedClient {
    name: String,
}

impl NamedClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Client for NamedClient {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Creates its product's artifact in the shared store when run.
pub struct TouchRunner {
    store: ArtifactStore,
    template: String,
    runs: Arc<AtomicU32>,
}

impl TouchRunner {
    pub fn new(store: ArtifactStore) -> Self {
        Self::with_template(store, "touch {{product}}")
    }

    pub fn with_template(store: ArtifactStore, template: impl Into<String>) -> Self {
        Self {
            store,
            template: template.into(),
            runs: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Shared run counter; clone before boxing the runner.
    pub fn run_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.runs)
    }
}

impl Runner for TouchRunner {
    fn init_source(&self) -> Result<Box<dyn Source>, SourceError> {
        Ok(Box::new(TemplatedSource::new(self.template.clone())))
    }

    fn run(&mut self, ctx: RunContext<'_>) -> Result<(), RunError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match ctx.product.identity() {
            Ok(Value::String(key)) => {
                self.store.create(&key);
                Ok(())
            }
            Ok(Value::Array(keys)) => {
                for key in keys {
                    if let Value::String(key) = key {
                        self.store.create(&key);
                    }
                }
                Ok(())
            }
            Ok(other) => Err(RunError::Failed(format!(
                "cannot touch non-string product identity: {other}"
            ))),
            Err(e) => Err(RunError::Other(Box::new(e))),
        }
    }

    fn kind(&self) -> &'static str {
        "touch"
    }
}

/// Runs successfully without touching anything.
pub struct NoopRunner {
    template: String,
}

impl NoopRunner {
    pub fn new() -> Self {
        Self::with_template("noop")
    }

    pub fn with_template(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl Default for NoopRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner for NoopRunner {
    fn init_source(&self) -> Result<Box<dyn Source>, SourceError> {
        Ok(Box::new(TemplatedSource::new(self.template.clone())))
    }

    fn run(&mut self, _ctx: RunContext<'_>) -> Result<(), RunError> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "noop"
    }
}

/// Always fails with the given message.
pub struct FailingRunner {
    message: String,
}

impl FailingRunner {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Runner for FailingRunner {
    fn init_source(&self) -> Result<Box<dyn Source>, SourceError> {
        Ok(Box::new(TemplatedSource::new("fail")))
    }

    fn run(&mut self, _ctx: RunContext<'_>) -> Result<(), RunError> {
        Err(RunError::Failed(self.message.clone()))
    }

    fn kind(&self) -> &'static str {
        "failing"
    }
}

/// Requests a graceful stop instead of doing work.
pub struct StoppingRunner {
    reason: String,
}

impl StoppingRunner {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Runner for StoppingRunner {
    fn init_source(&self) -> Result<Box<dyn Source>, SourceError> {
        Ok(Box::new(TemplatedSource::new("stop")))
    }

    fn run(&mut self, _ctx: RunContext<'_>) -> Result<(), RunError> {
        Err(RunError::Stop(GracefulStop::with_reason(self.reason.clone())))
    }

    fn kind(&self) -> &'static str {
        "stopping"
    }
}
