//! Shell-command formatting.
//!
//! Registered commands may reference their own dependency and target
//! lists with `[depends[0]]`/`[targets[1]]` placeholders, and any extra
//! keyword value with `[key]`. Formatting happens once, at registration;
//! the engine stores the finished string. Anything placeholder-shaped
//! left after substitution (a typo, an out-of-range index, a missing
//! keyword) fails the registration.

use std::{collections::BTreeMap, sync::Arc, sync::OnceLock};

use regex::Regex;

use crate::{task::Dependency, workflow::WorkflowError};
use anadama_tracked::Tracked;

/// Expand placeholders in `command`. Dependency indices count tracked
/// dependencies only; task markers carry no usable name. Bash test
/// constructs (`[ -f x ]`, `[[ ... ]]`) survive because the leftover
/// scan only trips on `[` followed by a letter.
pub fn format_command(
    command: &str,
    depends: &[Dependency],
    targets: &[Arc<Tracked>],
    kwargs: &BTreeMap<String, String>,
) -> Result<String, WorkflowError> {
    static LIST: OnceLock<Regex> = OnceLock::new();
    static KWARG: OnceLock<Regex> = OnceLock::new();
    static LEFTOVER: OnceLock<Regex> = OnceLock::new();
    let list = LIST.get_or_init(|| Regex::new(r"\[(depends|targets)\[(\d+)\]\]").unwrap());
    let kwarg = KWARG.get_or_init(|| Regex::new(r"\[([A-Za-z_][A-Za-z0-9_]*)\]").unwrap());
    let leftover = LEFTOVER.get_or_init(|| Regex::new(r"\[[a-zA-Z]").unwrap());

    let tracked_deps: Vec<&Arc<Tracked>> = depends
        .iter()
        .filter_map(Dependency::as_tracked)
        .collect();

    let replaced = list.replace_all(command, |caps: &regex::Captures<'_>| {
        let index: usize = caps[2].parse().unwrap_or(usize::MAX);
        let name = match &caps[1] {
            "depends" => tracked_deps.get(index).map(|d| d.name()),
            _ => targets.get(index).map(|t| t.name()),
        };
        match name {
            Some(name) => name.to_owned(),
            None => caps[0].to_owned(),
        }
    });

    let formatted = kwarg
        .replace_all(&replaced, |caps: &regex::Captures<'_>| {
            match kwargs.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_owned(),
            }
        })
        .into_owned();

    if leftover.is_match(&formatted) {
        return Err(WorkflowError::UnresolvedPlaceholder {
            original: command.to_owned(),
            formatted,
        });
    }

    Ok(formatted)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn dep(path: &str) -> Dependency {
        Dependency::Tracked(Arc::new(Tracked::huge_file(path)))
    }

    #[test]
    fn depends_and_targets_expand_by_index() {
        let depends = vec![dep("/in/a.txt"), Dependency::Task(4), dep("/in/b.txt")];
        let targets = vec![Arc::new(Tracked::huge_file("/out/c.txt"))];
        let formatted = format_command(
            "cat [depends[0]] [depends[1]] > [targets[0]]",
            &depends,
            &targets,
            &BTreeMap::new(),
        )
        .unwrap();
        // the task marker does not consume an index
        assert_eq!(formatted, "cat /in/a.txt /in/b.txt > /out/c.txt");
    }

    #[test]
    fn kwargs_expand() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("threads".to_owned(), "8".to_owned());
        let formatted = format_command("run -p [threads]", &[], &[], &kwargs).unwrap();
        assert_eq!(formatted, "run -p 8");
    }

    #[test]
    fn unknown_kwarg_is_an_error() {
        let err = format_command("run --sample [sample]", &[], &[], &BTreeMap::new()).unwrap_err();
        let WorkflowError::UnresolvedPlaceholder {
            original,
            formatted,
        } = err
        else {
            panic!("expected an unresolved placeholder error");
        };
        assert_eq!(original, "run --sample [sample]");
        assert!(formatted.contains("[sample]"));
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let err = format_command("cat [depends[2]]", &[dep("/a")], &[], &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::UnresolvedPlaceholder { .. }));
    }

    #[test]
    fn bash_test_constructs_survive() {
        let formatted =
            format_command("[ -f /etc/hosts ] && wc -l [depends[0]]", &[dep("/a")], &[], &BTreeMap::new())
                .unwrap();
        assert!(formatted.ends_with("/a"));
    }
}
