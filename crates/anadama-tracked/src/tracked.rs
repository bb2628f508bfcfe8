//! Tracked artifacts.
//!
//! A [`Tracked`] value is anything whose freshness the engine can observe:
//! files, directories, glob patterns, executables, in-memory variables,
//! plain strings, and function results. Each variant knows how to produce
//! a finite sequence of [`Fingerprint`] atoms via [`Tracked::compare`];
//! the engine persists those atoms and replays the comparison on the next
//! run to decide whether dependent tasks can be skipped.

use std::{
    fmt, fs,
    io::BufReader,
    iter,
    path::Path,
    sync::{Arc, OnceLock, RwLock},
    time::UNIX_EPOCH,
};

use camino::{Utf8Path, Utf8PathBuf};
use path_clean::PathClean;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh64::xxh64;

use crate::atom::Fingerprint;

/// Separator between the namespace and key of a tracked variable. The
/// joined form is the stable store key, so changing a variable's value
/// updates the stored atoms without changing the key.
pub const VARIABLE_KEY_SEPARATOR: &str = ":";

#[derive(Debug, Error)]
pub enum TrackedError {
    #[error("unable to stat `{path}`: {source}")]
    Stat {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("unable to read `{path}`: {source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("unable to list directory `{path}`: {source}")]
    ListDir {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("invalid glob pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },
    #[error("unable to find binary or script `{0}`")]
    ExecutableNotFound(String),
    #[error("function dependency `{key}` failed: {message}")]
    Function { key: String, message: String },
    #[error("`{path}` has a modification time before the unix epoch")]
    PreEpochMtime { path: Utf8PathBuf },
}

/// The lazy comparison sequence. Checksums and per-entry stats are only
/// computed when the consumer gets that far, so a size or mtime mismatch
/// never pays for a full file read.
pub type CompareSeq = Box<dyn Iterator<Item = Result<Fingerprint, TrackedError>> + Send>;

#[derive(Debug)]
pub struct FileEntry {
    pub path: Utf8PathBuf,
}

#[derive(Debug)]
pub struct PatternEntry {
    pub pattern: String,
}

#[derive(Debug)]
pub struct ExecutableEntry {
    pub path: Utf8PathBuf,
    pub version_command: String,
}

#[derive(Debug)]
pub struct VariableEntry {
    pub namespace: String,
    pub key: String,
    name: String,
    value: RwLock<String>,
}

impl VariableEntry {
    pub fn value(&self) -> String {
        self.value.read().expect("variable lock poisoned").clone()
    }

    pub fn set_value(&self, value: impl Into<String>) {
        *self.value.write().expect("variable lock poisoned") = value.into();
    }
}

#[derive(Debug)]
pub struct StringEntry {
    pub value: String,
}

type FingerprintFn = dyn Fn() -> Result<Fingerprint, String> + Send + Sync;

pub struct FunctionEntry {
    pub key: String,
    pub func: Arc<FingerprintFn>,
}

impl fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Tracked {
    /// A small file: size, mtime, and an adler32 checksum of the contents.
    File(FileEntry),
    /// A large file: size and mtime only, no checksum.
    HugeFile(FileEntry),
    /// A directory: its own stat, a hash of the sorted listing, and a
    /// size+mtime pair per entry.
    Directory(FileEntry),
    /// A shell glob: a hash of the sorted matches, then per-match stats.
    FilePattern(PatternEntry),
    /// A script or binary: version-command output plus file fingerprints.
    Executable(ExecutableEntry),
    /// A namespaced key/value pair; only the value participates in
    /// comparison.
    Variable(VariableEntry),
    /// A literal string; the string is both key and fingerprint.
    String(StringEntry),
    /// An arbitrary lookup (database row, API call) reduced to one atom.
    Function(FunctionEntry),
}

impl Tracked {
    pub fn file(path: impl AsRef<str>) -> Self {
        Tracked::File(FileEntry {
            path: absolute(path.as_ref()),
        })
    }

    pub fn huge_file(path: impl AsRef<str>) -> Self {
        Tracked::HugeFile(FileEntry {
            path: absolute(path.as_ref()),
        })
    }

    pub fn directory(path: impl AsRef<str>) -> Self {
        Tracked::Directory(FileEntry {
            path: absolute(path.as_ref()),
        })
    }

    pub fn file_pattern(pattern: impl AsRef<str>) -> Self {
        Tracked::FilePattern(PatternEntry {
            pattern: absolute(pattern.as_ref()).into_string(),
        })
    }

    /// Track an executable by path, or by name resolved on `$PATH`.
    /// `version_command` is a shell command template where `{}` is
    /// replaced with the resolved path.
    pub fn executable(
        name: impl AsRef<str>,
        version_command: Option<&str>,
    ) -> Result<Self, TrackedError> {
        let name = name.as_ref();
        let path = if Path::new(&expand(name)).exists() {
            absolute(name)
        } else {
            let found = which::which(name)
                .map_err(|_| TrackedError::ExecutableNotFound(name.to_owned()))?;
            Utf8PathBuf::from_path_buf(found)
                .map_err(|_| TrackedError::ExecutableNotFound(name.to_owned()))?
        };
        let version_command = version_command
            .unwrap_or("{} --version")
            .replace("{}", path.as_str());
        Ok(Tracked::Executable(ExecutableEntry {
            path,
            version_command,
        }))
    }

    pub fn variable(
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        let key = key.into();
        let name = format!("{namespace}{VARIABLE_KEY_SEPARATOR}{key}");
        Tracked::Variable(VariableEntry {
            namespace,
            key,
            name,
            value: RwLock::new(value.into()),
        })
    }

    pub fn string(value: impl Into<String>) -> Self {
        Tracked::String(StringEntry {
            value: value.into(),
        })
    }

    pub fn function<F>(key: impl Into<String>, func: F) -> Self
    where
        F: Fn() -> Result<Fingerprint, String> + Send + Sync + 'static,
    {
        Tracked::Function(FunctionEntry {
            key: key.into(),
            func: Arc::new(func),
        })
    }

    /// The variant tag used for interning and the dependency index.
    pub fn variant(&self) -> &'static str {
        match self {
            Tracked::File(_) => "File",
            Tracked::HugeFile(_) => "HugeFile",
            Tracked::Directory(_) => "Directory",
            Tracked::FilePattern(_) => "FilePattern",
            Tracked::Executable(_) => "Executable",
            Tracked::Variable(_) => "Variable",
            Tracked::String(_) => "String",
            Tracked::Function(_) => "Function",
        }
    }

    /// The unique key for this artifact; also the fingerprint store key.
    pub fn name(&self) -> &str {
        match self {
            Tracked::File(e) | Tracked::HugeFile(e) | Tracked::Directory(e) => e.path.as_str(),
            Tracked::FilePattern(e) => &e.pattern,
            Tracked::Executable(e) => e.path.as_str(),
            Tracked::Variable(e) => &e.name,
            Tracked::String(e) => &e.value,
            Tracked::Function(e) => &e.key,
        }
    }

    /// Whether this artifact must be produced by some task (or be
    /// declared pre-existing) before anything may depend on it.
    pub fn must_preexist(&self) -> bool {
        !matches!(
            self,
            Tracked::Variable(_) | Tracked::String(_) | Tracked::Function(_)
        )
    }

    /// Cheap existence probe, used for auto-promotion of dependencies to
    /// pre-existing artifacts in non-strict workflows.
    pub fn exists(&self) -> bool {
        match self {
            Tracked::File(e) | Tracked::HugeFile(e) => e.path.as_std_path().exists(),
            Tracked::Executable(e) => e.path.as_std_path().exists(),
            Tracked::Directory(e) => e.path.as_std_path().is_dir(),
            Tracked::FilePattern(e) => glob::glob(&e.pattern)
                .map(|mut matches| matches.next().is_some())
                .unwrap_or(false),
            Tracked::Variable(_) | Tracked::String(_) | Tracked::Function(_) => false,
        }
    }

    /// Produce the comparison sequence. Results are never cached: mtimes
    /// and directory listings are observed fresh on every call.
    pub fn compare(&self) -> CompareSeq {
        match self {
            Tracked::File(e) => small_file_compare(e.path.clone()),
            Tracked::HugeFile(e) => huge_file_compare(e.path.clone()),
            Tracked::Directory(e) => directory_compare(e.path.clone()),
            Tracked::FilePattern(e) => pattern_compare(e.pattern.clone()),
            Tracked::Executable(e) => executable_compare(e.path.clone(), e.version_command.clone()),
            Tracked::Variable(e) => Box::new(iter::once(Ok(Fingerprint::Text(e.value())))),
            Tracked::String(e) => Box::new(iter::once(Ok(Fingerprint::Text(e.value.clone())))),
            Tracked::Function(e) => {
                let key = e.key.clone();
                let func = Arc::clone(&e.func);
                Box::new(iter::once_with(move || {
                    func().map_err(|message| TrackedError::Function { key, message })
                }))
            }
        }
    }

    /// A serialisable description of this artifact, used to rebuild it in
    /// another process. `Function` artifacts carry arbitrary closures and
    /// cannot travel.
    pub fn to_spec(&self) -> Option<TrackedSpec> {
        Some(match self {
            Tracked::File(e) => TrackedSpec::File {
                path: e.path.clone(),
            },
            Tracked::HugeFile(e) => TrackedSpec::HugeFile {
                path: e.path.clone(),
            },
            Tracked::Directory(e) => TrackedSpec::Directory {
                path: e.path.clone(),
            },
            Tracked::FilePattern(e) => TrackedSpec::FilePattern {
                pattern: e.pattern.clone(),
            },
            Tracked::Executable(e) => TrackedSpec::Executable {
                path: e.path.clone(),
                version_command: e.version_command.clone(),
            },
            Tracked::Variable(e) => TrackedSpec::Variable {
                namespace: e.namespace.clone(),
                key: e.key.clone(),
                value: e.value(),
            },
            Tracked::String(e) => TrackedSpec::String {
                value: e.value.clone(),
            },
            Tracked::Function(_) => return None,
        })
    }
}

impl fmt::Display for Tracked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tracked::Variable(e) => f.write_str(&e.value()),
            other => f.write_str(other.name()),
        }
    }
}

/// Wire form of a [`Tracked`] artifact for the work-unit transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackedSpec {
    File {
        path: Utf8PathBuf,
    },
    HugeFile {
        path: Utf8PathBuf,
    },
    Directory {
        path: Utf8PathBuf,
    },
    FilePattern {
        pattern: String,
    },
    Executable {
        path: Utf8PathBuf,
        version_command: String,
    },
    Variable {
        namespace: String,
        key: String,
        value: String,
    },
    String {
        value: String,
    },
}

impl From<TrackedSpec> for Tracked {
    fn from(spec: TrackedSpec) -> Self {
        match spec {
            TrackedSpec::File { path } => Tracked::File(FileEntry { path }),
            TrackedSpec::HugeFile { path } => Tracked::HugeFile(FileEntry { path }),
            TrackedSpec::Directory { path } => Tracked::Directory(FileEntry { path }),
            TrackedSpec::FilePattern { pattern } => Tracked::FilePattern(PatternEntry { pattern }),
            TrackedSpec::Executable {
                path,
                version_command,
            } => Tracked::Executable(ExecutableEntry {
                path,
                version_command,
            }),
            TrackedSpec::Variable {
                namespace,
                key,
                value,
            } => Tracked::variable(namespace, key, value),
            TrackedSpec::String { value } => Tracked::String(StringEntry { value }),
        }
    }
}

/// Expand a leading `~` and `$VAR`/`${VAR}` references, like a shell
/// would before handing the engine a path.
pub fn expand(raw: &str) -> String {
    static VAR: OnceLock<Regex> = OnceLock::new();
    let var = VAR.get_or_init(|| Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))").unwrap());

    let mut s = raw.to_owned();
    if let Some(rest) = s.strip_prefix("~") {
        if rest.is_empty() || rest.starts_with('/') {
            if let Some(home) = dirs_next::home_dir() {
                s = format!("{}{}", home.to_string_lossy(), rest);
            }
        }
    }
    var.replace_all(&s, |caps: &regex::Captures<'_>| {
        let key = caps.get(1).or_else(|| caps.get(2)).unwrap().as_str();
        std::env::var(key).unwrap_or_default()
    })
    .into_owned()
}

/// Expand and absolutize a raw path without resolving symlinks, keeping
/// any trailing glob characters intact.
pub fn absolute(raw: &str) -> Utf8PathBuf {
    let expanded = expand(raw);
    let path = Path::new(&expanded);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    Utf8PathBuf::from_path_buf(joined.clean())
        .unwrap_or_else(|p| Utf8PathBuf::from(p.to_string_lossy().into_owned()))
}

fn stat(path: &Utf8Path) -> Result<(u64, u64), TrackedError> {
    let meta = fs::metadata(path).map_err(|source| TrackedError::Stat {
        path: path.to_owned(),
        source,
    })?;
    let mtime = meta
        .modified()
        .map_err(|source| TrackedError::Stat {
            path: path.to_owned(),
            source,
        })?
        .duration_since(UNIX_EPOCH)
        .map_err(|_| TrackedError::PreEpochMtime {
            path: path.to_owned(),
        })?;
    Ok((meta.len(), mtime.as_nanos() as u64))
}

fn checksum(path: &Utf8Path) -> Result<Fingerprint, TrackedError> {
    let file = fs::File::open(path).map_err(|source| TrackedError::Read {
        path: path.to_owned(),
        source,
    })?;
    let sum = adler32::adler32(BufReader::new(file)).map_err(|source| TrackedError::Read {
        path: path.to_owned(),
        source,
    })?;
    Ok(Fingerprint::Uint(u64::from(sum)))
}

fn listing_hash<S: AsRef<str>>(names: &[S]) -> Fingerprint {
    let mut joined = String::new();
    for name in names {
        joined.push_str(name.as_ref());
        joined.push('\0');
    }
    Fingerprint::Uint(xxh64(joined.as_bytes(), 0))
}

fn stat_atoms(path: Utf8PathBuf) -> std::vec::IntoIter<Result<Fingerprint, TrackedError>> {
    match stat(&path) {
        Ok((size, mtime)) => vec![Ok(size.into()), Ok(mtime.into())],
        Err(e) => vec![Err(e)],
    }
    .into_iter()
}

fn small_file_compare(path: Utf8PathBuf) -> CompareSeq {
    match stat(&path) {
        Err(e) => Box::new(iter::once(Err(e))),
        Ok((size, mtime)) => Box::new(
            [Ok(size.into()), Ok(mtime.into())]
                .into_iter()
                .chain(iter::once_with(move || checksum(&path))),
        ),
    }
}

fn huge_file_compare(path: Utf8PathBuf) -> CompareSeq {
    Box::new(stat_atoms(path))
}

fn directory_compare(path: Utf8PathBuf) -> CompareSeq {
    let (size, mtime) = match stat(&path) {
        Ok(pair) => pair,
        Err(e) => return Box::new(iter::once(Err(e))),
    };
    let entries = match fs::read_dir(&path) {
        Ok(entries) => entries,
        Err(source) => {
            return Box::new(iter::once(Err(TrackedError::ListDir { path, source })))
        }
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let header = [Ok(size.into()), Ok(mtime.into()), Ok(listing_hash(&names))];
    Box::new(
        header
            .into_iter()
            .chain(names.into_iter().flat_map(move |name| {
                stat_atoms(path.join(name))
            })),
    )
}

fn pattern_compare(pattern: String) -> CompareSeq {
    let matches = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(source) => {
            return Box::new(iter::once(Err(TrackedError::Pattern { pattern, source })))
        }
    };
    let mut files: Vec<Utf8PathBuf> = matches
        .filter_map(|p| p.ok())
        .map(|p| {
            Utf8PathBuf::from_path_buf(p)
                .unwrap_or_else(|p| Utf8PathBuf::from(p.to_string_lossy().into_owned()))
        })
        .collect();
    files.sort();

    let header = iter::once(Ok(listing_hash(
        &files.iter().map(|f| f.as_str().to_owned()).collect::<Vec<_>>(),
    )));
    Box::new(header.chain(files.into_iter().flat_map(stat_atoms)))
}

fn executable_compare(path: Utf8PathBuf, version_command: String) -> CompareSeq {
    let version = version_output(&version_command);
    let stat_path = path.clone();
    Box::new(
        version
            .map(|v| Ok(Fingerprint::Text(v)))
            .into_iter()
            .chain(stat_atoms(stat_path))
            .chain(iter::once_with(move || checksum(&path))),
    )
}

fn version_output(command: &str) -> Option<String> {
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    let text = text.trim().to_owned();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    fn collect(tracked: &Tracked) -> Vec<Fingerprint> {
        tracked
            .compare()
            .collect::<Result<Vec<_>, _>>()
            .expect("compare should succeed")
    }

    #[test]
    fn file_compare_yields_size_mtime_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, b"hello world").unwrap();

        let tracked = Tracked::file(path.to_str().unwrap());
        let atoms = collect(&tracked);
        assert_eq!(atoms.len(), 3);
        assert_eq!(atoms[0], Fingerprint::Uint(11));
    }

    #[test]
    fn file_compare_changes_with_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, b"one").unwrap();
        let tracked = Tracked::file(path.to_str().unwrap());
        let before = collect(&tracked);

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b" two").unwrap();
        drop(f);

        let after = collect(&tracked);
        assert_ne!(before, after);
    }

    #[test]
    fn huge_file_skips_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        fs::write(&path, b"payload").unwrap();

        let tracked = Tracked::huge_file(path.to_str().unwrap());
        assert_eq!(collect(&tracked).len(), 2);
    }

    #[test]
    fn missing_file_compare_errors() {
        let tracked = Tracked::file("/no/such/file/anywhere.txt");
        let first = tracked.compare().next().expect("one item");
        assert!(first.is_err());
    }

    #[test]
    fn directory_listing_change_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"a").unwrap();
        let tracked = Tracked::directory(dir.path().to_str().unwrap());
        let before = collect(&tracked);

        fs::write(dir.path().join("b"), b"b").unwrap();
        let after = collect(&tracked);
        assert_ne!(before, after);
    }

    #[test]
    fn pattern_compare_tracks_the_match_set() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), b"x").unwrap();
        fs::write(dir.path().join("y.log"), b"y").unwrap();

        let pattern = format!("{}/*.txt", dir.path().to_str().unwrap());
        let tracked = Tracked::file_pattern(&pattern);
        let before = collect(&tracked);
        // one hash atom plus size+mtime for the single match
        assert_eq!(before.len(), 3);

        fs::write(dir.path().join("z.txt"), b"z").unwrap();
        let after = collect(&tracked);
        assert_ne!(before[0], after[0]);
    }

    #[test]
    fn variable_key_is_stable_across_value_changes() {
        let tracked = Tracked::variable("myspace", "threads", "4");
        assert_eq!(tracked.name(), "myspace:threads");
        assert_eq!(collect(&tracked), vec![Fingerprint::Text("4".into())]);

        if let Tracked::Variable(entry) = &tracked {
            entry.set_value("8");
        }
        assert_eq!(tracked.name(), "myspace:threads");
        assert_eq!(collect(&tracked), vec![Fingerprint::Text("8".into())]);
    }

    #[test]
    fn function_compare_invokes_the_function() {
        let tracked = Tracked::function("row-count", || Ok(Fingerprint::Uint(42)));
        assert_eq!(collect(&tracked), vec![Fingerprint::Uint(42)]);

        let failing = Tracked::function("broken", || Err("boom".into()));
        assert!(failing.compare().next().unwrap().is_err());
    }

    #[test]
    fn absolute_keeps_glob_characters() {
        let key = absolute("out/*.txt");
        assert!(key.as_str().ends_with("out/*.txt"));
        assert!(key.as_str().starts_with('/'));
    }
}
