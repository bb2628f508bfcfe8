//! The dependency index: which task produces which artifact.
//!
//! Two-level map keyed by variant tag then artifact key. An entry mapping
//! to `None` marks a pre-existing artifact that no task produces. Lookups
//! are exact-match only; near-misses are reported by the workflow with a
//! suggestion from [`crate::matcher`].

use std::collections::HashMap;

use thiserror::Error;

use crate::tracked::Tracked;

pub type TaskNo = usize;

#[derive(Debug, Error)]
#[error("unable to find dependency `{key}` of type `{variant}`")]
pub struct NoSuchDependency {
    pub variant: &'static str,
    pub key: String,
}

#[derive(Default)]
pub struct DependencyIndex {
    idx: HashMap<&'static str, HashMap<String, Option<TaskNo>>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `dep` as produced by `task`, or as pre-existing when
    /// `task` is `None`. Re-linking overwrites; the workflow guards
    /// against duplicate targets before calling this.
    pub fn link(&mut self, dep: &Tracked, task: Option<TaskNo>) {
        self.idx
            .entry(dep.variant())
            .or_default()
            .insert(dep.name().to_owned(), task);
    }

    pub fn contains(&self, dep: &Tracked) -> bool {
        self.idx
            .get(dep.variant())
            .is_some_and(|inner| inner.contains_key(dep.name()))
    }

    /// The producing task for `dep`: `Ok(Some(no))` for a task target,
    /// `Ok(None)` for a pre-existing artifact, `Err` when unregistered.
    pub fn task_for(&self, dep: &Tracked) -> Result<Option<TaskNo>, NoSuchDependency> {
        self.idx
            .get(dep.variant())
            .and_then(|inner| inner.get(dep.name()))
            .copied()
            .ok_or_else(|| NoSuchDependency {
                variant: dep.variant(),
                key: dep.name().to_owned(),
            })
    }

    /// Iterate every registered key, for near-match diagnostics.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.idx.values().flat_map(|inner| inner.keys().map(String::as_str))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn link_and_lookup() {
        let mut index = DependencyIndex::new();
        let target = Tracked::huge_file("out/a.txt");
        let preexisting = Tracked::huge_file("in/raw.fastq");

        index.link(&target, Some(3));
        index.link(&preexisting, None);

        assert_eq!(index.task_for(&target).unwrap(), Some(3));
        assert_eq!(index.task_for(&preexisting).unwrap(), None);
        assert!(index.contains(&target));
    }

    #[test]
    fn missing_dependency_is_an_error() {
        let index = DependencyIndex::new();
        let dep = Tracked::huge_file("out/missing.txt");
        let err = index.task_for(&dep).unwrap_err();
        assert_eq!(err.variant, "HugeFile");
        assert!(err.key.ends_with("out/missing.txt"));
    }

    #[test]
    fn variants_are_separate_namespaces() {
        let mut index = DependencyIndex::new();
        let string = Tracked::string("alpha");
        index.link(&string, Some(0));

        let variable = Tracked::variable("alpha", "", "");
        assert!(!index.contains(&variable));
    }
}
