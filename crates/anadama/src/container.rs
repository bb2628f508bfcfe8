//! Ordered task storage with name and pattern lookup.

use std::{collections::HashMap, sync::Arc};

use crate::{
    pattern,
    task::{Task, TaskNo},
};

/// Tasks in registration order, with a secondary index by name. Names
/// need not be unique; a name lookup returns every match.
#[derive(Default)]
pub struct TaskContainer {
    tasks: Vec<Arc<Task>>,
    by_name: HashMap<String, Vec<TaskNo>>,
}

impl TaskContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Arc<Task>) {
        self.by_name
            .entry(task.name.clone())
            .or_default()
            .push(task.task_no);
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, task_no: TaskNo) -> Option<&Arc<Task>> {
        self.tasks.get(task_no)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.iter()
    }

    /// Tasks matching a name, a glob pattern over names, or a task
    /// number given in decimal.
    pub fn find(&self, name_or_no: &str) -> Vec<Arc<Task>> {
        if let Ok(task_no) = name_or_no.parse::<TaskNo>() {
            if let Some(task) = self.get(task_no) {
                return vec![task.clone()];
            }
        }
        if pattern::is_pattern(name_or_no) {
            match pattern::fnmatch_regex(name_or_no) {
                Ok(re) => self
                    .tasks
                    .iter()
                    .filter(|task| re.is_match(&task.name))
                    .cloned()
                    .collect(),
                Err(_) => Vec::new(),
            }
        } else {
            self.by_name
                .get(name_or_no)
                .map(|nos| nos.iter().filter_map(|no| self.get(*no)).cloned().collect())
                .unwrap_or_default()
        }
    }

    /// Every `(target key, producing task)` pair, in registration order.
    pub fn all_targets(&self) -> impl Iterator<Item = (&str, TaskNo)> {
        self.tasks.iter().flat_map(|task| {
            task.targets
                .iter()
                .map(move |target| (target.name(), task.task_no))
        })
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;
    use crate::task::Action;
    use anadama_tracked::Tracked;

    fn task(task_no: TaskNo, name: &str, target: Option<&str>) -> Arc<Task> {
        Arc::new(Task {
            task_no,
            name: name.to_owned(),
            description: name.to_owned(),
            depends: Vec::new(),
            targets: target
                .map(|t| vec![Arc::new(Tracked::huge_file(t))])
                .unwrap_or_default(),
            actions: vec![Action::sh("true")],
            visible: true,
            kwargs: BTreeMap::new(),
        })
    }

    #[test]
    fn lookup_by_number_name_and_pattern() {
        let mut container = TaskContainer::new();
        container.push(task(0, "align_sample_1", None));
        container.push(task(1, "align_sample_2", None));
        container.push(task(2, "summarize", None));

        assert_eq!(container.find("2")[0].name, "summarize");
        assert_eq!(container.find("summarize").len(), 1);
        assert_eq!(container.find("align_*").len(), 2);
        assert!(container.find("missing").is_empty());
    }

    #[test]
    fn duplicate_names_all_match() {
        let mut container = TaskContainer::new();
        container.push(task(0, "copy", None));
        container.push(task(1, "copy", None));
        assert_eq!(container.find("copy").len(), 2);
    }

    #[test]
    fn all_targets_lists_keys_with_owners() {
        let mut container = TaskContainer::new();
        container.push(task(0, "a", Some("/out/a.txt")));
        container.push(task(1, "b", Some("/out/b.txt")));
        let pairs: Vec<(String, TaskNo)> = container
            .all_targets()
            .map(|(k, no)| (k.to_owned(), no))
            .collect();
        assert_eq!(pairs.len(), 2);
        assert!(pairs[0].0.ends_with("/out/a.txt"));
        assert_eq!(pairs[1].1, 1);
    }
}
