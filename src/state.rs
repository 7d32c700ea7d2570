// mqtt2prom - Telemetry to Prometheus metric transformation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Persistent per-identity state.
//!
//! Every state identity owns one [`RuleState`]. Its durable part is written
//! as a JSON snapshot to `<state_dir>/<sanitized identity>-<xxh64>.json`.
//! Snapshots are written when the state is dirty and either a flush was
//! forced or the flush interval has passed since the last write.
//!
//! The store map lock is only held to find or insert an entry; each entry
//! has its own lock, so distinct identities evaluate in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use xxhash_rust::xxh64::xxh64;

use crate::error::{ExprError, StateError};
use crate::expr::Expression;

/// Default interval between two writes of the same state.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Part of the state that survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableState {
    /// Accumulated offset added to monotonic values
    #[serde(rename = "value_offset")]
    pub offset: f64,
    /// Last working value seen by the monotonicity step
    pub last_raw_value: f64,
    pub last_expr_value: f64,
    pub last_expr_raw_value: JsonValue,
    pub last_expr_result: f64,
    #[serde(rename = "last_expr_result_string")]
    pub last_expr_result_text: String,
    /// `None` until the first expression evaluation
    pub last_expr_timestamp: Option<DateTime<Utc>>,
}

impl DurableState {
    /// Time since the previous expression evaluation, zero if there was none.
    pub fn elapsed_since_eval(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.last_expr_timestamp
            .map(|previous| now - previous)
            .unwrap_or_else(chrono::Duration::zero)
    }
}

/// State of one identity: durable data plus in-memory bookkeeping.
#[derive(Debug, Default)]
pub struct RuleState {
    pub durable: DurableState,
    program: Option<Arc<Expression>>,
    last_flush: Option<Instant>,
    dirty: bool,
    force_flush: bool,
}

impl RuleState {
    fn loaded(durable: DurableState) -> Self {
        Self {
            durable,
            last_flush: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Compiled program for `source`, compiling it on first use.
    ///
    /// A fresh compile forces the next flush.
    pub fn compiled(&mut self, source: &str) -> Result<Arc<Expression>, ExprError> {
        if let Some(program) = &self.program {
            if program.source() == source {
                return Ok(Arc::clone(program));
            }
        }
        let program = Arc::new(Expression::compile(source)?);
        self.program = Some(Arc::clone(&program));
        self.force_flush = true;
        Ok(program)
    }

    /// Record a mutation that may wait for the flush interval.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Record a mutation that must reach disk on the next flush check.
    pub fn mark_urgent(&mut self) {
        self.dirty = true;
        self.force_flush = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn needs_flush(&self, interval: Duration, now: Instant) -> bool {
        self.dirty
            && (self.force_flush
                || self
                    .last_flush
                    .map_or(true, |at| now.duration_since(at) >= interval))
    }

    fn flushed(&mut self, now: Instant) {
        self.last_flush = Some(now);
        self.dirty = false;
        self.force_flush = false;
    }
}

/// Owner of every [`RuleState`].
#[derive(Debug)]
pub struct StateStore {
    directory: Option<PathBuf>,
    flush_interval: Duration,
    states: Mutex<HashMap<String, Arc<Mutex<RuleState>>>>,
}

impl StateStore {
    /// Store persisting snapshots under `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            directory: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Override the interval between two writes of the same state.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Number of identities seen so far.
    pub fn len(&self) -> usize {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot file for an identity.
    pub fn state_path(&self, key: &str) -> Option<PathBuf> {
        self.directory
            .as_ref()
            .map(|dir| dir.join(state_file_name(key)))
    }

    /// Run `f` with exclusive access to the state of `key`, then flush it if due.
    ///
    /// The state is loaded from disk on first access. Write failures are
    /// logged and do not affect the returned value.
    pub fn with_state<R>(&self, key: &str, f: impl FnOnce(&mut RuleState) -> R) -> R {
        let entry = self.entry(key);
        let mut state = entry.lock().unwrap_or_else(PoisonError::into_inner);

        let result = f(&mut state);

        let now = Instant::now();
        if state.needs_flush(self.flush_interval, now) {
            match self.write(key, &state.durable) {
                Ok(()) => state.flushed(now),
                Err(e) => warn!(state = key, error = %e, "Failed to persist state"),
            }
        }
        result
    }

    /// Copy of the durable state of `key`, if it has been accessed.
    pub fn snapshot(&self, key: &str) -> Option<DurableState> {
        let entry = self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()?;
        let state = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Some(state.durable.clone())
    }

    /// Write every dirty state now. Returns how many were written.
    ///
    /// All states are attempted; the first failure is returned.
    pub fn flush_all(&self) -> Result<usize, StateError> {
        let entries: Vec<(String, Arc<Mutex<RuleState>>)> = self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
            .collect();

        let mut written = 0;
        let mut first_error = None;
        for (key, entry) in entries {
            let mut state = entry.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.dirty {
                continue;
            }
            match self.write(&key, &state.durable) {
                Ok(()) => {
                    state.flushed(Instant::now());
                    written += 1;
                }
                Err(e) => {
                    warn!(state = %key, error = %e, "Failed to persist state");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    fn entry(&self, key: &str) -> Arc<Mutex<RuleState>> {
        if let Some(entry) = self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(entry);
        }

        let loaded = Arc::new(Mutex::new(self.load(key)));
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(states.entry(key.to_string()).or_insert(loaded))
    }

    fn load(&self, key: &str) -> RuleState {
        let Some(path) = self.state_path(key) else {
            return RuleState::default();
        };

        match read_snapshot(&path) {
            Ok(Some(durable)) => {
                debug!(state = key, path = %path.display(), "Loaded state");
                RuleState::loaded(durable)
            }
            Ok(None) => RuleState::default(),
            Err(e) => {
                warn!(state = key, error = %e, "Ignoring unreadable state");
                RuleState::default()
            }
        }
    }

    fn write(&self, key: &str, durable: &DurableState) -> Result<(), StateError> {
        let Some(path) = self.state_path(key) else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(durable)?;
        std::fs::write(&path, bytes).map_err(|source| StateError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(state = key, path = %path.display(), "Persisted state");
        Ok(())
    }
}

/// `Ok(None)` when no snapshot exists.
fn read_snapshot(path: &Path) -> Result<Option<DurableState>, StateError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StateError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// File name for an identity: readable prefix plus a hash keeping names unique.
pub fn state_file_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{:016x}.json", sanitized, xxh64(key.as_bytes(), 0))
}
