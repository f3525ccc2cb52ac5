//! Text-level message deduplication with on-disk history.
//!
//! Every triggered message is remembered as `sender|text` with its first-seen
//! time. A message is a duplicate when the exact key is known, or when the
//! same sender already sent a near-identical text (players re-post with a
//! typo fixed or an emoji added). Entries expire after a configurable window
//! so recurring greetings trigger again eventually.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Minimum seconds between history writes during normal operation. Clearing
/// the history always writes immediately.
const SAVE_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Serialize, Deserialize, Default)]
struct HistoryFile {
    messages: HashMap<String, u64>,
    last_updated: u64,
}

pub struct MessageDeduplicator {
    messages: HashMap<String, u64>,
    expiry_secs: u64,
    similarity_threshold: f64,
    store_path: PathBuf,
    last_saved: u64,
}

impl MessageDeduplicator {
    /// Open the deduplicator, loading and pruning any persisted history.
    /// A missing or unreadable history file starts empty.
    pub fn new(store_path: PathBuf, expiry_secs: u64, similarity_threshold: f64) -> Self {
        let mut dedup = Self {
            messages: HashMap::new(),
            expiry_secs,
            similarity_threshold,
            store_path,
            last_saved: 0,
        };
        dedup.load();
        dedup
    }

    fn load(&mut self) {
        let raw = match fs::read_to_string(&self.store_path) {
            Ok(raw) => raw,
            Err(_) => {
                debug!(
                    "No message history at {}, starting empty",
                    self.store_path.display()
                );
                return;
            }
        };
        match serde_json::from_str::<HistoryFile>(&raw) {
            Ok(file) => {
                self.messages = file.messages;
                let before = self.messages.len();
                self.prune(now_secs());
                info!(
                    "Loaded {} message(s) from history ({} expired)",
                    self.messages.len(),
                    before - self.messages.len()
                );
            }
            Err(e) => warn!(
                "Ignoring corrupt message history {}: {}",
                self.store_path.display(),
                e
            ),
        }
    }

    /// Whether this message was already handled recently. A fresh message is
    /// recorded and the history persisted (rate limited).
    pub fn is_duplicate(&mut self, sender: &str, text: &str) -> bool {
        self.is_duplicate_at(sender, text, now_secs())
    }

    fn is_duplicate_at(&mut self, sender: &str, text: &str, now: u64) -> bool {
        self.prune(now);

        let sender_key = normalize(sender);
        let text_key = normalize(text);
        let key = format!("{}|{}", sender_key, text_key);

        if self.messages.contains_key(&key) {
            debug!("Duplicate message (exact): {}", key);
            return true;
        }

        let prefix = format!("{}|", sender_key);
        for known in self.messages.keys() {
            let Some(known_text) = known.strip_prefix(&prefix) else {
                continue;
            };
            let sim = similarity(&text_key, known_text);
            if sim >= self.similarity_threshold {
                debug!(
                    "Duplicate message (similarity {:.2}): {} ~ {}",
                    sim, text_key, known_text
                );
                return true;
            }
        }

        self.messages.insert(key, now);
        if now.saturating_sub(self.last_saved) >= SAVE_INTERVAL_SECS {
            if let Err(e) = self.persist(now) {
                warn!("Failed to persist message history: {:#}", e);
            }
        }
        false
    }

    fn prune(&mut self, now: u64) {
        let expiry = self.expiry_secs;
        self.messages
            .retain(|_, &mut seen| now.saturating_sub(seen) < expiry);
    }

    /// Drop all remembered messages and persist the empty history at once.
    pub fn clear(&mut self) -> Result<()> {
        self.messages.clear();
        self.persist(now_secs())
    }

    fn persist(&mut self, now: u64) -> Result<()> {
        let file = HistoryFile {
            messages: self.messages.clone(),
            last_updated: now,
        };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp = self.store_path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.store_path)
            .with_context(|| format!("Failed to replace {}", self.store_path.display()))?;
        self.last_saved = now;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Lowercase and collapse runs of whitespace to single spaces.
fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Similarity ratio of two strings: 2 * LCS / (len_a + len_b), over chars.
fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for &ca in &a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs = prev[b.len()];
    2.0 * lcs as f64 / (a.len() + b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_memory(dir: &tempfile::TempDir) -> MessageDeduplicator {
        MessageDeduplicator::new(dir.path().join("messages.json"), 3600, 0.95)
    }

    #[test]
    fn test_fresh_then_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let mut dedup = in_memory(&dir);
        assert!(!dedup.is_duplicate_at("Alice", "hello there", 1000));
        assert!(dedup.is_duplicate_at("Alice", "hello there", 1001));
    }

    #[test]
    fn test_normalization_collapses_case_and_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let mut dedup = in_memory(&dir);
        assert!(!dedup.is_duplicate_at("Alice", "Hello   World", 1000));
        assert!(dedup.is_duplicate_at("alice", "hello world", 1001));
    }

    #[test]
    fn test_near_identical_same_sender_is_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let mut dedup = in_memory(&dir);
        assert!(!dedup.is_duplicate_at("Alice", "attack the north gate at dawn!", 1000));
        assert!(dedup.is_duplicate_at("Alice", "attack the north gate at dawn", 1001));
    }

    #[test]
    fn test_same_text_different_sender_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let mut dedup = in_memory(&dir);
        assert!(!dedup.is_duplicate_at("Alice", "hello there", 1000));
        assert!(!dedup.is_duplicate_at("Bob", "hello there", 1001));
    }

    #[test]
    fn test_entries_expire() {
        let dir = tempfile::tempdir().unwrap();
        let mut dedup = in_memory(&dir);
        assert!(!dedup.is_duplicate_at("Alice", "hello there", 1000));
        // Still remembered just inside the window, forgotten past it.
        assert!(dedup.is_duplicate_at("Alice", "hello there", 1000 + 3599));
        assert!(!dedup.is_duplicate_at("Alice", "hello there", 1000 + 3600 + 3600));
    }

    #[test]
    fn test_history_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");
        {
            let mut dedup = MessageDeduplicator::new(path.clone(), 3600, 0.95);
            assert!(!dedup.is_duplicate("Alice", "hello there"));
        }
        let mut reloaded = MessageDeduplicator::new(path, 3600, 0.95);
        assert!(reloaded.is_duplicate("Alice", "hello there"));
    }

    #[test]
    fn test_clear_persists_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");
        let mut dedup = MessageDeduplicator::new(path.clone(), 3600, 0.95);
        assert!(!dedup.is_duplicate("Alice", "hello there"));
        dedup.clear().unwrap();
        assert!(dedup.is_empty());

        let reloaded = MessageDeduplicator::new(path, 3600, 0.95);
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_corrupt_history_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");
        fs::write(&path, "{not json").unwrap();
        let dedup = MessageDeduplicator::new(path, 3600, 0.95);
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_similarity_ratio() {
        assert!((similarity("abc", "abc") - 1.0).abs() < 1e-9);
        assert_eq!(similarity("abc", ""), 0.0);
        // One char dropped out of ten: 2*9/19
        assert!((similarity("abcdefghij", "abcdefghi") - 18.0 / 19.0).abs() < 1e-9);
        assert!(similarity("completely", "different!") < 0.5);
    }
}
