//! anadama-backend: the persistent fingerprint store.
//!
//! A flat key/value map from artifact keys to their last-seen comparison
//! atoms, stored as JSON arrays in an embedded [`sled`] tree. All of a
//! task's target keys are written in one atomic batch: an interrupted run
//! leaves either the whole task recorded or none of it.
//!
//! Only the run coordinator writes; workers never touch the store.

use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use anadama_tracked::Fingerprint;

/// Environment variable overriding the fingerprint store directory.
pub const ENV_VAR: &str = "ANADAMA_BACKEND_DIR";

/// Directory created under a workflow's output dir to hold the store.
pub const LOCAL_DB_FOLDER: &str = ".anadama";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unable to open fingerprint store at `{path}`: {source}")]
    Open {
        path: Utf8PathBuf,
        source: sled::Error,
    },
    #[error("fingerprint store i/o failed: {0}")]
    Store(#[from] sled::Error),
    #[error("stored fingerprint for `{key}` is not valid JSON: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
    #[error("fingerprint for `{key}` could not be encoded: {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },
    #[error("saved {keys} keys but {values} value lists")]
    KeyValueMismatch { keys: usize, values: usize },
}

/// The fingerprint store. Cheap to clone handles are not provided on
/// purpose; the coordinator owns the single instance.
pub struct Backend {
    db: sled::Db,
    path: Utf8PathBuf,
}

impl Backend {
    /// Open (creating if needed) the store in `dir`.
    pub fn open(dir: impl AsRef<Utf8Path>) -> Result<Self, BackendError> {
        let path = dir.as_ref().to_owned();
        std::fs::create_dir_all(&path).map_err(|e| BackendError::Open {
            path: path.clone(),
            source: sled::Error::Io(e),
        })?;
        let db = sled::open(&path).map_err(|source| BackendError::Open {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path, "opened fingerprint store");
        Ok(Self { db, path })
    }

    /// Open the default store for a workflow. With an output directory
    /// the store lives under `<output>/.anadama/db`; otherwise the
    /// discovery chain of [`discover_data_directory`] applies.
    pub fn default_for_output(output: Option<&Utf8Path>) -> Result<Self, BackendError> {
        match output {
            Some(dir) => Self::open(dir.join(LOCAL_DB_FOLDER).join("db")),
            None => Self::open(discover_data_directory()),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn lookup(&self, key: &str) -> Result<Option<Vec<Fingerprint>>, BackendError> {
        let Some(raw) = self.db.get(key)? else {
            return Ok(None);
        };
        let atoms = serde_json::from_slice(&raw).map_err(|source| BackendError::Corrupt {
            key: key.to_owned(),
            source,
        })?;
        Ok(Some(atoms))
    }

    pub fn lookup_many(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<Vec<Fingerprint>>>, BackendError> {
        keys.iter().map(|key| self.lookup(key)).collect()
    }

    /// Save all `(key, atoms)` pairs in one atomic batch.
    pub fn save(
        &self,
        keys: &[String],
        values: &[Vec<Fingerprint>],
    ) -> Result<(), BackendError> {
        if keys.is_empty() {
            return Ok(());
        }
        if keys.len() != values.len() {
            return Err(BackendError::KeyValueMismatch {
                keys: keys.len(),
                values: values.len(),
            });
        }
        let mut batch = sled::Batch::default();
        for (key, atoms) in keys.iter().zip(values) {
            let encoded = serde_json::to_vec(atoms).map_err(|source| BackendError::Encode {
                key: key.clone(),
                source,
            })?;
            batch.insert(key.as_bytes(), encoded);
        }
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.db.remove(key)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn delete_many<I, S>(&self, keys: I) -> Result<(), BackendError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut batch = sled::Batch::default();
        for key in keys {
            batch.remove(key.as_ref().as_bytes());
        }
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    /// Iterate every stored key in lexicographic order.
    pub fn keys(&self) -> impl Iterator<Item = Result<String, BackendError>> {
        self.db.iter().keys().map(|res| {
            res.map(|key| String::from_utf8_lossy(&key).into_owned())
                .map_err(BackendError::from)
        })
    }

    /// Dump the entire store as `key -> atoms`, for the operational CLI.
    pub fn dump(&self) -> Result<HashMap<String, Vec<Fingerprint>>, BackendError> {
        let mut out = HashMap::new();
        for pair in self.db.iter() {
            let (key, raw) = pair?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let atoms = serde_json::from_slice(&raw).map_err(|source| BackendError::Corrupt {
                key: key.clone(),
                source,
            })?;
            out.insert(key, atoms);
        }
        Ok(out)
    }

    pub fn close(self) -> Result<(), BackendError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Resolve the default data directory, in priority order: the
/// `ANADAMA_BACKEND_DIR` environment variable, `$HOME/.config/anadama/db`,
/// `./.anadama/db`, and finally `/tmp/anadama/db`. The chosen directory
/// is created when missing; a directory that cannot be created falls
/// through to the next candidate with a warning.
pub fn discover_data_directory() -> Utf8PathBuf {
    if let Ok(dir) = std::env::var(ENV_VAR) {
        if let Some(dir) = try_dir(Utf8PathBuf::from(dir)) {
            return dir;
        }
    }
    if let Some(home) = dirs_next::home_dir().and_then(|h| Utf8PathBuf::from_path_buf(h).ok()) {
        if let Some(dir) = try_dir(home.join(".config").join("anadama").join("db")) {
            return dir;
        }
    }
    if let Some(dir) = try_dir(Utf8PathBuf::from(LOCAL_DB_FOLDER).join("db")) {
        return dir;
    }
    Utf8PathBuf::from("/tmp/anadama/db")
}

fn try_dir(dir: Utf8PathBuf) -> Option<Utf8PathBuf> {
    if dir.as_std_path().is_dir() {
        return Some(dir);
    }
    match std::fs::create_dir_all(&dir) {
        Ok(()) => Some(dir),
        Err(e) => {
            warn!(dir = %dir, error = %e, "unable to create store directory, trying fallback");
            None
        }
    }
}
