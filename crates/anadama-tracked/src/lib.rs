//! anadama-tracked: tracked artifacts and fingerprint comparison.
//!
//! This crate holds the data model the incremental engine is built on:
//! [`Tracked`] artifacts with their lazy [`Tracked::compare`] sequences,
//! the per-workflow [`TrackedInterner`], the [`DependencyIndex`] mapping
//! artifacts to their producing tasks, and [`any_different`], the single
//! decision procedure behind the skip pass.

mod atom;
mod index;
mod intern;
pub mod matcher;
mod tracked;

use std::sync::Arc;

use itertools::{EitherOrBoth, Itertools};
use tracing::debug;

pub use atom::Fingerprint;
pub use index::{DependencyIndex, NoSuchDependency, TaskNo};
pub use intern::TrackedInterner;
pub use tracked::{
    absolute, expand, CompareSeq, ExecutableEntry, FileEntry, FunctionEntry, PatternEntry,
    StringEntry, Tracked, TrackedError, TrackedSpec, VariableEntry, VARIABLE_KEY_SEPARATOR,
};

/// Decide whether any artifact in `deps` differs from its stored
/// fingerprint. `lookup` fetches the previously saved atoms for a key.
///
/// An artifact counts as different when it was never saved, when its
/// comparison sequence raises, or when any atom differs pairwise from the
/// stored sequence (length mismatches included). Store access errors are
/// the caller's to surface; they abort the decision.
pub fn any_different<E, L>(deps: &[Arc<Tracked>], mut lookup: L) -> Result<bool, E>
where
    L: FnMut(&str) -> Result<Option<Vec<Fingerprint>>, E>,
{
    for dep in deps {
        let Some(past) = lookup(dep.name())? else {
            debug!(
                dep = dep.name(),
                variant = dep.variant(),
                "changed: not previously saved in backend"
            );
            return Ok(true);
        };

        for pair in dep.compare().zip_longest(past.iter()) {
            match pair {
                EitherOrBoth::Both(Ok(current), stored) if current == *stored => continue,
                EitherOrBoth::Both(Err(e), _) => {
                    debug!(
                        dep = dep.name(),
                        variant = dep.variant(),
                        error = %e,
                        "changed: compare() raised"
                    );
                    return Ok(true);
                }
                _ => {
                    debug!(
                        dep = dep.name(),
                        variant = dep.variant(),
                        "changed: compare() differs from last save"
                    );
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}
