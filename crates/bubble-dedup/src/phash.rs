//! Visual bubble deduplication by perceptual hash.
//!
//! Re-reading a bubble's text costs a full profile-page round trip, so
//! bubbles that still sit on screen from the previous poll are filtered out
//! before any text extraction happens. A small ring of recent bubble hashes
//! is enough; the chat column only ever shows a handful of bubbles.

use anyhow::{Context, Result};
use image::RgbaImage;
use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    hash: String,
    sender: String,
}

struct Remembered {
    id: String,
    sender: String,
    hash: ImageHash,
}

pub struct BubbleImageDeduplicator {
    hasher: Hasher,
    recent: VecDeque<Remembered>,
    capacity: usize,
    max_distance: u32,
    store_path: PathBuf,
}

impl BubbleImageDeduplicator {
    /// Open the deduplicator, reloading any persisted hashes. Two hashes
    /// within `max_distance` bits of each other count as the same bubble.
    pub fn new(store_path: PathBuf, capacity: usize, max_distance: u32) -> Self {
        let hasher = HasherConfig::new()
            .hash_alg(HashAlg::DoubleGradient)
            .hash_size(8, 8)
            .to_hasher();
        let mut dedup = Self {
            hasher,
            recent: VecDeque::with_capacity(capacity),
            capacity,
            max_distance,
            store_path,
        };
        dedup.load();
        dedup
    }

    fn load(&mut self) {
        let raw = match fs::read_to_string(&self.store_path) {
            Ok(raw) => raw,
            Err(_) => {
                debug!(
                    "No bubble hash store at {}, starting empty",
                    self.store_path.display()
                );
                return;
            }
        };
        let entries: HashMap<String, StoredEntry> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "Ignoring corrupt bubble hash store {}: {}",
                    self.store_path.display(),
                    e
                );
                return;
            }
        };
        for (id, entry) in entries {
            let Some(bytes) = decode_hex(&entry.hash) else {
                warn!("Skipping bubble '{}' with malformed hash", id);
                continue;
            };
            match ImageHash::from_bytes(&bytes) {
                Ok(hash) => {
                    self.recent.push_back(Remembered {
                        id,
                        sender: entry.sender,
                        hash,
                    });
                    if self.recent.len() > self.capacity {
                        self.recent.pop_front();
                    }
                }
                Err(_) => warn!("Skipping bubble '{}' with invalid hash bytes", id),
            }
        }
        info!("Loaded {} bubble hash(es)", self.recent.len());
    }

    /// Whether this bubble was already seen. A fresh bubble is remembered
    /// (evicting the oldest past capacity) and the store persisted.
    pub fn is_duplicate(&mut self, id: &str, sender: &str, bubble: &RgbaImage) -> bool {
        let hash = self.hasher.hash_image(bubble);

        for known in &self.recent {
            let dist = hash.dist(&known.hash);
            if dist <= self.max_distance {
                debug!(
                    "Duplicate bubble '{}' matches '{}' (distance {})",
                    id, known.id, dist
                );
                return true;
            }
        }

        self.recent.push_back(Remembered {
            id: id.to_string(),
            sender: sender.to_string(),
            hash,
        });
        while self.recent.len() > self.capacity {
            self.recent.pop_front();
        }
        if let Err(e) = self.persist() {
            warn!("Failed to persist bubble hashes: {:#}", e);
        }
        false
    }

    /// Forget all remembered bubbles and persist the empty store.
    pub fn clear(&mut self) -> Result<()> {
        self.recent.clear();
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let entries: HashMap<&str, StoredEntry> = self
            .recent
            .iter()
            .map(|r| {
                (
                    r.id.as_str(),
                    StoredEntry {
                        hash: encode_hex(r.hash.as_bytes()),
                        sender: r.sender.clone(),
                    },
                )
            })
            .collect();
        let json = serde_json::to_string_pretty(&entries)?;
        let tmp = self.store_path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.store_path)
            .with_context(|| format!("Failed to replace {}", self.store_path.display()))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
