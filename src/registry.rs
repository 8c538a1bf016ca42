//! Named adapter registry.
//!
//! An insertion-ordered name → value store with an active selection. The
//! tuner model keeps one for adapter configurations and every
//! [`crate::TunerLayer`] keeps one for its per-layer adapter parameters.

use crate::error::{PeftError, Result};

/// Registry for managing multiple named adapters.
///
/// Iteration follows insertion order, which is also the order in which
/// active adapters are summed during a forward pass.
#[derive(Debug)]
pub struct AdapterRegistry<T> {
    /// Entries in insertion order
    entries: Vec<(String, T)>,
    /// Currently active adapter names
    active: Vec<String>,
}

impl<T> Default for AdapterRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            active: Vec::new(),
        }
    }
}

impl<T> AdapterRegistry<T> {
    /// Create a new empty adapter registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new adapter with the given name.
    ///
    /// # Errors
    /// Returns an error if an adapter with this name already exists
    pub fn register(&mut self, name: impl Into<String>, value: T) -> Result<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(PeftError::AdapterExists { name });
        }
        self.entries.push((name, value));
        Ok(())
    }

    /// Insert or replace an entry, keeping the position of a replaced name.
    ///
    /// Returns the previous value, if any.
    pub fn insert(&mut self, name: impl Into<String>, value: T) -> Option<T> {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    /// Remove an entry and drop it from the active selection.
    pub fn remove(&mut self, name: &str) -> Option<T> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;
        self.active.retain(|a| a != name);
        Some(self.entries.remove(pos).1)
    }

    /// Get a reference to an adapter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Get a mutable reference to an adapter by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Look up an adapter, failing with the list of available names.
    ///
    /// # Errors
    /// Returns an error if no adapter with this name exists
    pub fn require(&self, name: &str) -> Result<&T> {
        self.get(name)
            .ok_or_else(|| PeftError::not_found(name, &self.names()))
    }

    /// Check if an adapter exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Names in insertion order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Iterate over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Iterate mutably over entries in insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut T)> {
        self.entries.iter_mut().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Active adapter names.
    #[must_use]
    pub fn active(&self) -> &[String] {
        &self.active
    }

    /// Select active adapters; every name must be registered.
    ///
    /// # Errors
    /// Returns a lookup error naming all missing adapters
    pub fn set_active(&mut self, names: &[String]) -> Result<()> {
        let mut missing: Vec<&str> = names
            .iter()
            .map(String::as_str)
            .filter(|n| !self.contains(n))
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(PeftError::not_found(missing.join(", "), &self.names()));
        }
        self.active = names.to_vec();
        Ok(())
    }

    /// Select active adapters without checking that they exist here.
    ///
    /// Used on layers, where an adapter may target other modules only.
    pub fn set_active_unchecked(&mut self, names: &[String]) {
        self.active = names.to_vec();
    }

    /// Active entries present in this registry, in activation order.
    pub fn active_entries(&self) -> impl Iterator<Item = (&str, &T)> {
        self.active
            .iter()
            .filter_map(|name| self.get(name).map(|v| (name.as_str(), v)))
    }
}
