//! Namespace scopes.
//!
//! A scope is a stack of namespace names owned by one [`Cache`] value. The
//! innermost name is the active namespace: every wire key derived while it
//! is open embeds that namespace's current token. Invalidating a namespace
//! writes a new token, which makes every key derived from the old one
//! unreachable without touching the keys themselves.
//!
//! [`Cache`]: crate::Cache

use std::sync::{Mutex, MutexGuard};

/// Stack of open namespaces for one call context.
#[derive(Debug, Default)]
pub struct NamespaceScope {
    stack: Mutex<Vec<String>>,
}

impl NamespaceScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.stack.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn push(&self, name: &str) -> usize {
        let mut stack = self.lock();
        stack.push(name.to_string());
        stack.len() - 1
    }

    pub(crate) fn pop(&self) -> Option<String> {
        self.lock().pop()
    }

    pub(crate) fn truncate(&self, depth: usize) {
        self.lock().truncate(depth);
    }

    /// The innermost open namespace.
    pub fn active(&self) -> Option<String> {
        self.lock().last().cloned()
    }

    pub fn depth(&self) -> usize {
        self.lock().len()
    }
}

/// Restores a scope to its depth when dropped, so a namespace opened by
/// `with_namespace` is closed on every exit path, including panics and
/// cancelled futures.
pub(crate) struct ScopeGuard<'a> {
    scope: &'a NamespaceScope,
    depth: usize,
}

impl<'a> ScopeGuard<'a> {
    pub(crate) fn enter(scope: &'a NamespaceScope, name: &str) -> Self {
        let depth = scope.push(name);
        Self { scope, depth }
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.scope.truncate(self.depth);
    }
}
