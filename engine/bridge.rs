// ========================================================================================
//                          Identifier namespace translation
// ========================================================================================

use crate::table::{KeyedTable, TableError};
use std::collections::HashMap;
use std::sync::Arc;

/// A single-id lookup into another namespace. `None` is an expected outcome, not a failure.
pub trait Resolver: Send + Sync {
    fn lookup(&self, id: &str) -> Option<String>;
}

impl<F> Resolver for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn lookup(&self, id: &str) -> Option<String> {
        self(id)
    }
}

impl Resolver for HashMap<String, String> {
    fn lookup(&self, id: &str) -> Option<String> {
        self.get(id).cloned()
    }
}

/// A resolver backed by one field of a keyed table: key → value of `target_field`.
/// Empty target values count as unmapped.
#[derive(Debug, Clone)]
pub struct TableResolver {
    table: KeyedTable,
    target_field: String,
}

impl TableResolver {
    pub fn new(table: KeyedTable, target_field: &str) -> Result<Self, TableError> {
        if !table.has_field(target_field) {
            return Err(TableError::UnknownField(target_field.to_string()));
        }
        Ok(Self {
            table,
            target_field: target_field.to_string(),
        })
    }
}

impl Resolver for TableResolver {
    fn lookup(&self, id: &str) -> Option<String> {
        self.table
            .get(id, &self.target_field)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

/// Resolves ids through an injected `Resolver`, dropping those with no mapping.
#[derive(Clone)]
pub struct IdentifierBridge {
    resolver: Arc<dyn Resolver>,
}

impl IdentifierBridge {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }

    pub fn resolve(&self, id: &str) -> Option<String> {
        self.resolver.lookup(id)
    }

    /// Filter-and-compact: the output never outgrows the input, and every pair starts with
    /// an id taken from the input.
    pub fn resolve_many<S: AsRef<str>>(&self, ids: &[S]) -> Vec<(String, String)> {
        ids.iter()
            .filter_map(|id| {
                let id = id.as_ref();
                self.resolve(id).map(|mapped| (id.to_string(), mapped))
            })
            .collect()
    }
}
