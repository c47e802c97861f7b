//! Products: the persistent artifacts tasks fire.
//!
//! The engine treats products as collaborators behind the [`Product`]
//! trait: it renders their identifying structure, checks existence,
//! records metadata after a successful run, and uploads. How an artifact
//! is physically stored belongs to the implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use super::client::Client;
use super::params::Params;
use super::template::TemplateError;

/// Errors raised by product operations.
#[derive(Debug, Error)]
pub enum ProductError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Storage-side failure (existence check, metadata I/O, transfer).
    #[error("product storage error: {0}")]
    Storage(String),
}

/// Persistent metadata recorded against a product after a successful run.
///
/// The stored source code is the outdatedness marker: a product whose
/// recorded source differs from the task's current rendered source is
/// considered outdated by code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// When the product was last produced.
    pub timestamp: Option<DateTime<Utc>>,

    /// The rendered source code that produced it.
    pub stored_source_code: Option<String>,
}

impl Metadata {
    /// Record a fresh build: stamp now and remember the source identity.
    pub fn update(&mut self, source_code: &str) {
        self.timestamp = Some(Utc::now());
        self.stored_source_code = Some(source_code.to_string());
    }

    /// Forget everything recorded.
    pub fn clear(&mut self) {
        self.timestamp = None;
        self.stored_source_code = None;
    }
}

/// A persistent artifact produced by exactly one task.
pub trait Product: fmt::Debug + Send {
    /// Resolve the product's identifying structure against params.
    fn render(&mut self, params: &Params) -> Result<(), ProductError>;

    /// The rendered identity (a path, a table name, a collection of them).
    fn identity(&self) -> Result<Value, ProductError>;

    /// Whether the artifact currently exists in storage.
    fn exists(&self) -> Result<bool, ProductError>;

    fn metadata(&self) -> &Metadata;

    fn metadata_mut(&mut self) -> &mut Metadata;

    /// Persist a fresh metadata record for the given source identity.
    fn update_metadata(&mut self, source_code: &str) -> Result<(), ProductError> {
        self.metadata_mut().update(source_code);
        Ok(())
    }

    /// Re-apply an identity rendered in another process (snapshot restore).
    fn restore_identity(&mut self, identity: &Value) -> Result<(), ProductError> {
        let _ = identity;
        Ok(())
    }

    /// Drop any memoized remote metadata so the next read is fresh.
    fn clear_cached_metadata(&mut self) {}

    /// Fetch a remote copy of the artifact, if the storage is remote.
    fn download(&mut self) -> Result<(), ProductError> {
        Ok(())
    }

    /// Push the artifact to remote storage, if the storage is remote.
    fn upload(&mut self) -> Result<(), ProductError> {
        Ok(())
    }

    /// Client this product talks to, if any.
    fn client(&self) -> Option<&dyn Client> {
        None
    }

    /// Placeholder products are never injected into params and are always
    /// considered to exist.
    fn is_placeholder(&self) -> bool {
        false
    }

    /// Short type tag for diagnostics.
    fn kind(&self) -> &'static str;
}

/// The designated no-op placeholder for tasks that produce nothing.
#[derive(Debug, Default)]
pub struct NullProduct {
    metadata: Metadata,
}

impl NullProduct {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Product for NullProduct {
    fn render(&mut self, _params: &Params) -> Result<(), ProductError> {
        Ok(())
    }

    fn identity(&self) -> Result<Value, ProductError> {
        Ok(Value::Null)
    }

    fn exists(&self) -> Result<bool, ProductError> {
        Ok(true)
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn is_placeholder(&self) -> bool {
        true
    }

    fn kind(&self) -> &'static str {
        "null"
    }
}

/// A fixed ordered collection of products owned by a single task.
///
/// The task is complete only when every member exists. Render, metadata
/// and transfer operations fan out to the members; the identity is the
/// array of member identities.
#[derive(Debug)]
pub struct MetaProduct {
    products: Vec<Box<dyn Product>>,
    metadata: Metadata,
}

impl MetaProduct {
    pub fn new(products: Vec<Box<dyn Product>>) -> Self {
        Self {
            products,
            metadata: Metadata::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Product> {
        self.products.get(index).map(|p| p.as_ref())
    }
}

impl Product for MetaProduct {
    fn render(&mut self, params: &Params) -> Result<(), ProductError> {
        for product in &mut self.products {
            product.render(params)?;
        }
        Ok(())
    }

    fn identity(&self) -> Result<Value, ProductError> {
        let identities: Result<Vec<Value>, ProductError> =
            self.products.iter().map(|p| p.identity()).collect();
        Ok(Value::Array(identities?))
    }

    fn restore_identity(&mut self, identity: &Value) -> Result<(), ProductError> {
        if let Value::Array(identities) = identity {
            for (product, member) in self.products.iter_mut().zip(identities) {
                product.restore_identity(member)?;
            }
        }
        Ok(())
    }

    fn exists(&self) -> Result<bool, ProductError> {
        for product in &self.products {
            if !product.exists()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn update_metadata(&mut self, source_code: &str) -> Result<(), ProductError> {
        self.metadata.update(source_code);
        for product in &mut self.products {
            product.update_metadata(source_code)?;
        }
        Ok(())
    }

    fn clear_cached_metadata(&mut self) {
        for product in &mut self.products {
            product.clear_cached_metadata();
        }
    }

    fn download(&mut self) -> Result<(), ProductError> {
        for product in &mut self.products {
            product.download()?;
        }
        Ok(())
    }

    fn upload(&mut self) -> Result<(), ProductError> {
        for product in &mut self.products {
            product.upload()?;
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "meta"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryProduct;

    #[test]
    fn test_metadata_update_records_source_and_timestamp() {
        let mut meta = Metadata::default();
        assert!(meta.timestamp.is_none());

        meta.update("SELECT 1");

        assert!(meta.timestamp.is_some());
        assert_eq!(meta.stored_source_code.as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn test_metadata_clear() {
        let mut meta = Metadata::default();
        meta.update("code");
        meta.clear();
        assert_eq!(meta, Metadata::default());
    }

    #[test]
    fn test_null_product_is_placeholder_and_exists() {
        let product = NullProduct::new();
        assert!(product.is_placeholder());
        assert!(product.exists().unwrap());
        assert_eq!(product.identity().unwrap(), Value::Null);
    }

    #[test]
    fn test_meta_product_exists_requires_all_members() {
        let present = InMemoryProduct::new("a.csv");
        present.store().create("a.csv");
        let missing = InMemoryProduct::with_store("b.csv", present.store().clone());

        let meta = MetaProduct::new(vec![Box::new(present), Box::new(missing)]);
        assert!(!meta.exists().unwrap());

        let p1 = InMemoryProduct::new("a.csv");
        p1.store().create("a.csv");
        let p2 = InMemoryProduct::with_store("b.csv", p1.store().clone());
        p1.store().create("b.csv");
        let meta = MetaProduct::new(vec![Box::new(p1), Box::new(p2)]);
        assert!(meta.exists().unwrap());
    }

    #[test]
    fn test_meta_product_identity_is_member_array() {
        let mut p1 = InMemoryProduct::new("a.csv");
        let mut p2 = InMemoryProduct::new("b.csv");
        let params = Params::new();
        p1.render(&params).unwrap();
        p2.render(&params).unwrap();

        let meta = MetaProduct::new(vec![Box::new(p1), Box::new(p2)]);
        assert_eq!(
            meta.identity().unwrap(),
            serde_json::json!(["a.csv", "b.csv"])
        );
    }

    #[test]
    fn test_meta_product_update_metadata_fans_out() {
        let p1 = InMemoryProduct::new("a.csv");
        let store = p1.store().clone();
        let meta_members = vec![
            Box::new(p1) as Box<dyn Product>,
            Box::new(InMemoryProduct::with_store("b.csv", store)),
        ];
        let mut meta = MetaProduct::new(meta_members);

        meta.update_metadata("code v1").unwrap();

        assert_eq!(meta.metadata().stored_source_code.as_deref(), Some("code v1"));
        for i in 0..meta.len() {
            let member = meta.get(i).unwrap();
            assert_eq!(member.metadata().stored_source_code.as_deref(), Some("code v1"));
        }
    }
}
