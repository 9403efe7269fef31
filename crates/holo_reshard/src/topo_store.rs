//! Versioned topology store.
//!
//! Every write is a compare-and-set against `TopologyState::version`: callers
//! read a snapshot, build the next state off to the side, and publish it only
//! if nobody committed in between. Readers always get a whole state.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::error::{ReshardError, Result};
use crate::topology::TopologyState;

/// Attempts `update` makes before reporting a version conflict.
const UPDATE_ATTEMPTS: usize = 8;

#[derive(Clone)]
pub struct TopoStore {
    state: Arc<RwLock<TopologyState>>,
    path: Option<PathBuf>,
}

impl TopoStore {
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(TopologyState::default())),
            path: None,
        }
    }

    /// Open the JSON topology file at `path`, creating an empty one if missing.
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(data) => serde_json::from_slice::<TopologyState>(&data)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => TopologyState::default(),
            Err(err) => return Err(err.into()),
        };
        let store = Self {
            state: Arc::new(RwLock::new(state)),
            path: Some(path),
        };
        {
            let state = store.state.read().unwrap_or_else(PoisonError::into_inner);
            store.persist(&state)?;
        }
        Ok(store)
    }

    pub fn state(&self) -> TopologyState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version
    }

    /// Publish `next` if the stored version is still `expected_version`.
    ///
    /// The committed state carries `expected_version + 1`.
    pub fn compare_and_set(&self, expected_version: u64, mut next: TopologyState) -> Result<u64> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.version != expected_version {
            return Err(ReshardError::Transient(format!(
                "topology version conflict: expected {expected_version}, found {}",
                state.version
            )));
        }
        next.version = expected_version.saturating_add(1);
        self.persist(&next)?;
        *state = next;
        Ok(state.version)
    }

    /// Read-modify-write with compare-and-set, retrying on version conflicts.
    ///
    /// `mutate` runs on a private copy; if it fails, or changes nothing,
    /// nothing is published.
    pub fn update<T, F>(&self, mut mutate: F) -> Result<T>
    where
        F: FnMut(&mut TopologyState) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.state();
            let expected = current.version;
            let mut next = current.clone();
            let out = mutate(&mut next)?;
            if next == current {
                return Ok(out);
            }
            match self.compare_and_set(expected, next) {
                Ok(version) => {
                    debug!(version, attempt, "topology update committed");
                    return Ok(out);
                }
                Err(err) if err.is_retryable() && attempt < UPDATE_ATTEMPTS => {
                    debug!(error = %err, attempt, "topology update raced; retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn persist(&self, state: &TopologyState) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_vec_pretty(state)?;
        // Atomic replace via rename.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
