//! Dialect registry
//!
//! A [`Dialect`] is the named entry point of a database vendor: given a
//! source config it builds the [`Source`] that knows the vendor's driver,
//! connection string and table type. Dialects live in a process-wide
//! registry keyed by name. Built-in dialects are registered the first time
//! the registry is touched; others call [`register_dialect`] during startup.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use crate::error::{Error, Result};
use crate::source::Source;

/// A database vendor's strategy for building sources
pub trait Dialect: Send + Sync {
    /// Build a source from its JSON config
    fn source(&self, config: serde_json::Value) -> Result<Arc<dyn Source>>;
}

static DIALECTS: LazyLock<RwLock<HashMap<String, Arc<dyn Dialect>>>> = LazyLock::new(|| {
    #[allow(unused_mut)]
    let mut builtin: HashMap<String, Arc<dyn Dialect>> = HashMap::new();
    #[cfg(feature = "postgres")]
    builtin.insert(
        crate::postgres::DIALECT_NAME.to_owned(),
        Arc::new(crate::postgres::PgDialect),
    );
    RwLock::new(builtin)
});

/// Register a dialect under `name`.
///
/// # Panics
///
/// Registering the same name twice is a programming error and panics.
pub fn register_dialect(name: impl Into<String>, dialect: Arc<dyn Dialect>) {
    let name = name.into();
    let mut dialects = DIALECTS.write();
    if dialects.contains_key(&name) {
        drop(dialects);
        panic!("dialect {name} is already registered");
    }
    dialects.insert(name, dialect);
}

/// Look up a registered dialect
pub fn dialect(name: &str) -> Result<Arc<dyn Dialect>> {
    DIALECTS
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| Error::config(format!("dialect {name} is not registered")))
}

/// Names of all registered dialects, sorted
pub fn dialect_names() -> Vec<String> {
    let mut names: Vec<String> = DIALECTS.read().keys().cloned().collect();
    names.sort();
    names
}
