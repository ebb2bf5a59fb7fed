//! Dead-letter queue: failed rows parked in per-adapter journals for review.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// One quarantined row: the original payload plus why it failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub adapter_id: String,
    pub error: String,
    pub payload: serde_json::Value,
    pub quarantined_at: DateTime<Utc>,
}

/// On-disk journal row. The fingerprint rides along so reopening a journal
/// never has to re-hash payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalLine {
    fingerprint: String,
    #[serde(flatten)]
    letter: DeadLetter,
}

#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    pub fingerprint: String,
    pub journal: PathBuf,
    /// The same payload was already parked in this journal.
    pub deduplicated: bool,
}

/// File-backed DLQ. Each adapter gets one JSON-lines journal per day
/// (`{adapter}-{YYYYMMDD}.jsonl`); a row is a single appended line, and
/// duplicate payloads are caught by a fingerprint index that is rebuilt
/// lazily from the journal the first time it is touched, so dedup survives
/// restarts.
#[derive(Debug)]
pub struct DeadLetterStore {
    root: PathBuf,
    indexed: Mutex<HashMap<PathBuf, HashSet<String>>>,
}

impl DeadLetterStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            indexed: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable identity of a payload, independent of why it failed.
    pub fn fingerprint(payload: &serde_json::Value) -> String {
        hex::encode(Sha256::digest(payload.to_string().as_bytes()))
    }

    fn journal_path(&self, adapter_id: &str, day: NaiveDate) -> PathBuf {
        self.root
            .join(format!("{}-{}.jsonl", adapter_id, day.format("%Y%m%d")))
    }

    async fn read_journal(path: &Path) -> anyhow::Result<Vec<JournalLine>> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading journal {}", path.display()));
            }
        };

        let mut lines = Vec::new();
        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalLine>(line) {
                Ok(parsed) => lines.push(parsed),
                // Journals get hand-edited during review; a mangled line
                // should not poison the rest of the file.
                Err(err) => {
                    warn!(path = %path.display(), line = number + 1, error = %err, "skipping unreadable journal line");
                }
            }
        }
        Ok(lines)
    }

    /// Park one failed row. Appends a single journal line unless this
    /// payload is already in today's journal for the adapter.
    pub async fn quarantine(&self, letter: &DeadLetter) -> anyhow::Result<DeadLetterRecord> {
        let fingerprint = Self::fingerprint(&letter.payload);
        let journal = self.journal_path(&letter.adapter_id, letter.quarantined_at.date_naive());

        let mut indexed = self.indexed.lock().await;
        let seen = match indexed.entry(journal.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let existing = Self::read_journal(&journal)
                    .await?
                    .into_iter()
                    .map(|line| line.fingerprint)
                    .collect();
                entry.insert(existing)
            }
        };

        if seen.contains(&fingerprint) {
            return Ok(DeadLetterRecord {
                fingerprint,
                journal,
                deduplicated: true,
            });
        }

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating DLQ directory {}", self.root.display()))?;

        let line = serde_json::to_string(&JournalLine {
            fingerprint: fingerprint.clone(),
            letter: letter.clone(),
        })
        .context("serializing dead letter")?;

        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&journal)
            .await
            .with_context(|| format!("opening journal {}", journal.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to journal {}", journal.display()))?;
        file.write_all(b"\n")
            .await
            .with_context(|| format!("appending to journal {}", journal.display()))?;

        seen.insert(fingerprint.clone());
        Ok(DeadLetterRecord {
            fingerprint,
            journal,
            deduplicated: false,
        })
    }

    /// Everything parked for an adapter on a given day, for review tooling.
    pub async fn parked(
        &self,
        adapter_id: &str,
        day: NaiveDate,
    ) -> anyhow::Result<Vec<DeadLetter>> {
        let journal = self.journal_path(adapter_id, day);
        Ok(Self::read_journal(&journal)
            .await?
            .into_iter()
            .map(|line| line.letter)
            .collect())
    }
}
