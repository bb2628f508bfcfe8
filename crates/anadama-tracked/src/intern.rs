//! Per-workflow interning of tracked artifacts.
//!
//! Constructing the same artifact twice must hand back the same instance,
//! otherwise two `Tracked` values for one file would be indexed and
//! fingerprinted independently. The interner is owned by the workflow so
//! that multiple workflows can coexist in one process.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::tracked::{Tracked, TrackedError};

#[derive(Default)]
pub struct TrackedInterner {
    inner: Mutex<HashMap<(&'static str, String), Arc<Tracked>>>,
}

impl TrackedInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an artifact under its `(variant, key)` pair. If an artifact
    /// with the same pair already exists, the existing instance is
    /// returned with its state and the argument is dropped.
    pub fn intern(&self, tracked: Tracked) -> Arc<Tracked> {
        let key = (tracked.variant(), tracked.name().to_owned());
        self.inner
            .lock()
            .expect("interner mutex poisoned")
            .entry(key)
            .or_insert_with(|| Arc::new(tracked))
            .clone()
    }

    pub fn file(&self, path: impl AsRef<str>) -> Arc<Tracked> {
        self.intern(Tracked::file(path))
    }

    pub fn huge_file(&self, path: impl AsRef<str>) -> Arc<Tracked> {
        self.intern(Tracked::huge_file(path))
    }

    pub fn directory(&self, path: impl AsRef<str>) -> Arc<Tracked> {
        self.intern(Tracked::directory(path))
    }

    pub fn file_pattern(&self, pattern: impl AsRef<str>) -> Arc<Tracked> {
        self.intern(Tracked::file_pattern(pattern))
    }

    pub fn executable(
        &self,
        name: impl AsRef<str>,
        version_command: Option<&str>,
    ) -> Result<Arc<Tracked>, TrackedError> {
        Ok(self.intern(Tracked::executable(name, version_command)?))
    }

    pub fn string(&self, value: impl Into<String>) -> Arc<Tracked> {
        self.intern(Tracked::string(value))
    }

    pub fn function<F>(&self, key: impl Into<String>, func: F) -> Arc<Tracked>
    where
        F: Fn() -> Result<crate::Fingerprint, String> + Send + Sync + 'static,
    {
        self.intern(Tracked::function(key, func))
    }

    /// Intern a variable. An already-interned variable keeps its current
    /// value; use [`TrackedInterner::set_variable`] to change it.
    pub fn variable(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Arc<Tracked> {
        self.intern(Tracked::variable(namespace, key, value))
    }

    /// Intern a variable and set its value, whether or not it existed.
    /// The composite `namespace:key` store key is stable, so the change
    /// surfaces through `compare()` on the same key.
    pub fn set_variable(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Arc<Tracked> {
        let value = value.into();
        let interned = self.variable(namespace, key, value.clone());
        if let Tracked::Variable(entry) = interned.as_ref() {
            entry.set_value(value);
        }
        interned
    }

    /// Translate a raw string into the conventional artifact type:
    /// strings ending in `/` become directories, everything else a huge
    /// file. Mirrors the coercion applied to task depends/targets.
    pub fn auto(&self, raw: &str) -> Arc<Tracked> {
        if raw.ends_with('/') {
            self.directory(raw)
        } else {
            self.huge_file(raw)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interning_returns_the_same_instance() {
        let interner = TrackedInterner::new();
        let a = interner.huge_file("some/output.txt");
        let b = interner.huge_file("some/output.txt");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn variants_do_not_collide() {
        let interner = TrackedInterner::new();
        let file = interner.huge_file("thing");
        let string = interner.string(file.name().to_owned());
        assert!(!Arc::ptr_eq(&file, &string));
    }

    #[test]
    fn existing_variable_keeps_its_state() {
        let interner = TrackedInterner::new();
        let first = interner.variable("ns", "jobs", "2");
        let second = interner.variable("ns", "jobs", "16");
        assert!(Arc::ptr_eq(&first, &second));
        if let Tracked::Variable(entry) = second.as_ref() {
            assert_eq!(entry.value(), "2");
        } else {
            panic!("expected a variable");
        }
    }

    #[test]
    fn set_variable_updates_in_place() {
        let interner = TrackedInterner::new();
        let first = interner.variable("ns", "jobs", "2");
        let second = interner.set_variable("ns", "jobs", "16");
        assert!(Arc::ptr_eq(&first, &second));
        if let Tracked::Variable(entry) = first.as_ref() {
            assert_eq!(entry.value(), "16");
        } else {
            panic!("expected a variable");
        }
    }

    #[test]
    fn auto_picks_directory_for_trailing_slash() {
        let interner = TrackedInterner::new();
        assert_eq!(interner.auto("data/").variant(), "Directory");
        assert_eq!(interner.auto("data/file.txt").variant(), "HugeFile");
    }
}
