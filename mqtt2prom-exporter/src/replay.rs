// mqtt2prom Exporter - Message replay engine
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Replays recorded bus messages through the ingestion path.
//!
//! The replay file holds one JSON object per line:
//!
//! ```text
//! {"topic": "v1/devices/me/dht22", "payload": {"temperature": 21.5}, "delay_ms": 1000}
//! ```
//!
//! `delay_ms` is the wait before the message, divided by the replay speed.
//! Blank lines and lines starting with `#` are skipped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::ingest::Ingestor;
use crate::metrics::update_replay_metrics;

/// Configuration for message replay.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Path to the JSON-lines file.
    pub path: PathBuf,
    /// Replay speed multiplier (1.0 = recorded pace, 10.0 = 10x faster).
    pub speed: f64,
    /// Whether to restart at the end of the file.
    pub loop_replay: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            speed: 1.0,
            loop_replay: false,
        }
    }
}

/// Progress of the replay engine.
#[derive(Debug, Default)]
pub struct ReplayState {
    /// Index of the next message.
    pub position: AtomicUsize,
    /// Messages in the file.
    pub total_messages: AtomicUsize,
    /// Completed passes over the file.
    pub passes: AtomicUsize,
    /// Whether replay is running.
    pub running: AtomicBool,
}

/// One recorded message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplayMessage {
    pub topic: String,
    pub payload: JsonValue,
    #[serde(default)]
    pub delay_ms: u64,
}

/// Replay engine feeding recorded messages to an [`Ingestor`].
pub struct ReplayEngine {
    config: ReplayConfig,
    state: Arc<ReplayState>,
    ingestor: Arc<Ingestor>,
    messages: Vec<ReplayMessage>,
}

impl ReplayEngine {
    /// Load a replay file.
    pub fn from_file(config: ReplayConfig, ingestor: Arc<Ingestor>) -> Result<Self, ReplayError> {
        if config.speed <= 0.0 || !config.speed.is_finite() {
            return Err(ReplayError::InvalidSpeed(config.speed));
        }

        let messages = Self::parse_file(&config.path)?;
        if messages.is_empty() {
            return Err(ReplayError::EmptyReplay);
        }

        let state = Arc::new(ReplayState::default());
        state.total_messages.store(messages.len(), Ordering::SeqCst);

        info!(
            "Loaded replay: {} messages from {}",
            messages.len(),
            config.path.display()
        );

        Ok(Self {
            config,
            state,
            ingestor,
            messages,
        })
    }

    /// Parse a JSON-lines replay file.
    fn parse_file(path: &Path) -> Result<Vec<ReplayMessage>, ReplayError> {
        let text = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_lines(&text)
    }

    fn parse_lines(text: &str) -> Result<Vec<ReplayMessage>, ReplayError> {
        text.lines()
            .enumerate()
            .filter(|(_, line)| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with('#')
            })
            .map(|(number, line)| {
                serde_json::from_str(line).map_err(|source| ReplayError::InvalidLine {
                    line: number + 1,
                    source,
                })
            })
            .collect()
    }

    /// Get the replay state.
    pub fn state(&self) -> Arc<ReplayState> {
        Arc::clone(&self.state)
    }

    /// Start the replay loop (runs until the file is exhausted, or forever when looping).
    pub async fn run(&self) {
        self.state.running.store(true, Ordering::SeqCst);
        info!(
            "Starting replay: speed={}, loop={}",
            self.config.speed, self.config.loop_replay
        );

        loop {
            let position = self.state.position.load(Ordering::SeqCst);

            if position >= self.messages.len() {
                self.state.passes.fetch_add(1, Ordering::SeqCst);
                if self.config.loop_replay {
                    info!("Replay complete, looping...");
                    self.state.position.store(0, Ordering::SeqCst);
                    continue;
                }
                info!("Replay complete, stopping");
                break;
            }

            let message = &self.messages[position];
            let delay_ms = (message.delay_ms as f64 / self.config.speed) as u64;
            if delay_ms > 0 {
                sleep(Duration::from_millis(delay_ms)).await;
            }

            let records = self.ingestor.handle(&message.topic, &message.payload);
            debug!(position, topic = %message.topic, records, "Replayed message");

            self.state.position.fetch_add(1, Ordering::SeqCst);
            update_replay_metrics(position + 1, self.messages.len(), self.config.speed);
        }

        self.state.running.store(false, Ordering::SeqCst);
    }
}

/// Replay errors.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid message on line {line}: {source}")]
    InvalidLine {
        line: usize,
        source: serde_json::Error,
    },

    #[error("Replay file holds no messages")]
    EmptyReplay,

    #[error("Replay speed must be positive, got {0}")]
    InvalidSpeed(f64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PresentationCache;
    use mqtt2prom::{Config, StateStore, Transformer};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_replay_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# recorded on the lab bench").unwrap();
        writeln!(
            file,
            r#"{{"topic": "v1/devices/me/plug", "payload": {{"energy": 10.0}}}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"topic": "v1/devices/me/plug", "payload": {{"energy": 4.0}}, "delay_ms": 5}}"#
        )
        .unwrap();
        file.flush().unwrap();
        file
    }

    fn ingestor() -> (Arc<Ingestor>, Arc<Transformer>) {
        let config = Config::from_yaml(
            "metrics:\n  - metrics:\n      - prom_name: energy\n        force_monotonicy: true\n",
        )
        .unwrap();
        let transformer = Arc::new(Transformer::new(
            config.rules.clone(),
            StateStore::in_memory(),
        ));
        let cache = Arc::new(PresentationCache::new(Duration::from_secs(60)));
        let ingestor = Arc::new(Ingestor::new(&config, Arc::clone(&transformer), cache));
        (ingestor, transformer)
    }

    #[test]
    fn test_parse_lines() {
        let messages = ReplayEngine::parse_lines(
            "{\"topic\": \"a/b\", \"payload\": 1}\n\n# comment\n{\"topic\": \"a/c\", \"payload\": \"x\", \"delay_ms\": 20}\n",
        )
        .unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].delay_ms, 0);
        assert_eq!(messages[1].topic, "a/c");
        assert_eq!(messages[1].delay_ms, 20);
    }

    #[test]
    fn test_invalid_line_reports_number() {
        let err = ReplayEngine::parse_lines("{\"topic\": \"a\", \"payload\": 1}\nnot json\n")
            .unwrap_err();
        assert!(matches!(err, ReplayError::InvalidLine { line: 2, .. }));
    }

    #[test]
    fn test_invalid_speed() {
        let (ingestor, _) = ingestor();
        let config = ReplayConfig {
            speed: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            ReplayEngine::from_file(config, ingestor),
            Err(ReplayError::InvalidSpeed(_))
        ));
    }

    #[tokio::test]
    async fn test_replay_runs_to_end() {
        let file = create_replay_file();
        let (ingestor, transformer) = ingestor();
        let config = ReplayConfig {
            path: file.path().to_path_buf(),
            speed: 10.0,
            loop_replay: false,
        };

        let engine = ReplayEngine::from_file(config, ingestor).unwrap();
        let state = engine.state();
        assert_eq!(state.total_messages.load(Ordering::SeqCst), 2);

        engine.run().await;

        assert_eq!(state.position.load(Ordering::SeqCst), 2);
        assert_eq!(state.passes.load(Ordering::SeqCst), 1);
        assert!(!state.running.load(Ordering::SeqCst));

        let snapshot = transformer
            .store()
            .snapshot("v1/devices/me/plug$energy$plug$energy")
            .unwrap();
        assert_eq!(snapshot.offset, 10.0);
    }
}
