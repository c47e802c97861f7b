//! Task sources.
//!
//! A source is the templated description of a task's work (a SQL script,
//! a shell command, a notebook path). The engine only needs to render it
//! with params and read the resulting code; executing it is the job of the
//! concrete [`Runner`](super::task::Runner).

use std::fmt;
use thiserror::Error;

use super::params::{Params, PRODUCT_KEY, UPSTREAM_KEY};
use super::template::{self, TemplateError};

/// Errors raised while rendering a source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The source's code was read before [`Source::render`] ran.
    #[error("source '{0}' has not been rendered yet")]
    NotRendered(String),
}

/// Templated work description consumed by the engine.
pub trait Source: fmt::Debug + Send {
    /// Resolve the source against the task's params.
    fn render(&mut self, params: &Params) -> Result<(), SourceError>;

    /// The rendered code. Errors if [`Source::render`] has not run yet.
    fn code(&self) -> Result<&str, SourceError>;

    /// Re-apply code rendered in another process (snapshot restore).
    fn restore_rendered(&mut self, code: String);

    /// Optional human-readable description of the work.
    fn doc(&self) -> Option<&str> {
        None
    }

    /// Optional location (path, URL) the source came from.
    fn loc(&self) -> Option<&str> {
        None
    }

    /// Optional short name.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Optional file extension hint for the code.
    fn extension(&self) -> Option<&str> {
        None
    }
}

/// A source backed by a `{{placeholder}}` template string.
#[derive(Debug, Clone)]
pub struct TemplatedSource {
    template: String,
    rendered: Option<String>,
    doc: Option<String>,
    loc: Option<String>,
    name: Option<String>,
    extension: Option<String>,
}

impl TemplatedSource {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            rendered: None,
            doc: None,
            loc: None,
            name: None,
            extension: None,
        }
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn with_loc(mut self, loc: impl Into<String>) -> Self {
        self.loc = Some(loc.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// The raw template text.
    pub fn template(&self) -> &str {
        &self.template
    }
}

impl Source for TemplatedSource {
    fn render(&mut self, params: &Params) -> Result<(), SourceError> {
        // product/upstream are engine-injected and a template is free to
        // ignore them.
        let rendered = template::render(&self.template, params, &[PRODUCT_KEY, UPSTREAM_KEY])?;
        self.rendered = Some(rendered);
        Ok(())
    }

    fn code(&self) -> Result<&str, SourceError> {
        self.rendered.as_deref().ok_or_else(|| {
            SourceError::NotRendered(self.name.clone().unwrap_or_else(|| self.template.clone()))
        })
    }

    fn restore_rendered(&mut self, code: String) {
        self.rendered = Some(code);
    }

    fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    fn loc(&self) -> Option<&str> {
        self.loc.as_deref()
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }
}
