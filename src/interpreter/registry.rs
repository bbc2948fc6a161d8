//! Declaration registry
//!
//! Names are compared case-insensitively and must be unique within each
//! declaration category. Entries keep their declaration order so that
//! "first declared backend" is well defined.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::{CompileError, Result};

/// Declaration category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeclKind {
    /// `probe`
    Probe,
    /// `backend`
    Backend,
    /// `acl`
    Acl,
    /// `sub`
    Subroutine,
}

impl fmt::Display for DeclKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeclKind::Probe => "Probe",
            DeclKind::Backend => "Backend",
            DeclKind::Acl => "ACL",
            DeclKind::Subroutine => "Subroutine",
        };
        f.write_str(name)
    }
}

/// Insertion-ordered, case-insensitive name table for one category.
#[derive(Debug, Clone)]
pub struct Registry<T> {
    kind: DeclKind,
    entries: Vec<(String, T)>,
    index: HashMap<String, usize>,
}

impl<T> Registry<T> {
    /// Empty registry for `kind`.
    pub fn new(kind: DeclKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Category this registry holds.
    pub fn kind(&self) -> DeclKind {
        self.kind
    }

    /// Register `value` under `name`, failing if the name is taken.
    pub fn insert(&mut self, name: &str, value: T) -> Result<usize> {
        let key = name.to_ascii_lowercase();
        if self.index.contains_key(&key) {
            return Err(CompileError::DuplicateName {
                kind: self.kind,
                name: name.to_string(),
            });
        }
        let slot = self.entries.len();
        self.entries.push((name.to_string(), value));
        self.index.insert(key, slot);
        Ok(slot)
    }

    /// Position of `name` in declaration order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(&name.to_ascii_lowercase()).copied()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Value registered under `name`.
    pub fn get(&self, name: &str) -> Option<&T> {
        self.position(name).map(|slot| &self.entries[slot].1)
    }

    /// Mutable value registered under `name`.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        let slot = self.position(name)?;
        Some(&mut self.entries[slot].1)
    }

    /// Resolve `name` or fail with an unknown-reference error.
    pub fn resolve(&self, name: &str) -> Result<&T> {
        self.get(name).ok_or_else(|| CompileError::UnknownReference {
            kind: self.kind,
            name: name.to_string(),
        })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in declaration order, with names as declared.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Consume into values in declaration order.
    pub fn into_values(self) -> Vec<T> {
        self.entries.into_iter().map(|(_, value)| value).collect()
    }
}
