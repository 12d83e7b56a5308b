//! Approximate per-link distinct-visitor counting
//!
//! Each link starts with an exact set of visitor hashes. Once the set grows
//! past the configured threshold it is folded into a HyperLogLog sketch, which
//! keeps memory fixed (16 KiB per link) at roughly 0.8% standard error.
//! Only cardinalities leave this module; visitor hashes are never enumerated.

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::IpAddr;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::analytics::plan::EventFilter;
use crate::cursor::EventCursor;
use crate::storage::EventStore;

/// Register index bits. 2^14 registers.
const HLL_PRECISION: u32 = 14;

/// HyperLogLog cardinality sketch
#[derive(Debug, Clone)]
pub struct HyperLogLog {
    registers: Vec<u8>,
}

impl HyperLogLog {
    pub fn new() -> Self {
        Self {
            registers: vec![0; 1 << HLL_PRECISION],
        }
    }

    pub fn add(&mut self, item: &str) {
        let hash = hash64(item);
        let index = (hash >> (64 - HLL_PRECISION)) as usize;
        // Sentinel bit bounds the rank when the remaining bits are all zero
        let remaining = (hash << HLL_PRECISION) | (1 << (HLL_PRECISION - 1));
        let rank = remaining.leading_zeros() as u8 + 1;
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    pub fn estimate(&self) -> u64 {
        let m = self.registers.len() as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let (sum, zeros) = self
            .registers
            .iter()
            .fold((0.0f64, 0usize), |(sum, zeros), &r| {
                (sum + 2f64.powi(-(r as i32)), zeros + usize::from(r == 0))
            });

        let raw = alpha * m * m / sum;
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            // Linear counting for small cardinalities
            m * (m / zeros as f64).ln()
        } else {
            raw
        };
        estimate.round() as u64
    }
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::new()
    }
}

fn hash64(item: &str) -> u64 {
    let digest = Sha256::digest(item.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[derive(Debug)]
enum VisitorSet {
    Exact(HashSet<String>),
    Sketch(Box<HyperLogLog>),
}

impl VisitorSet {
    fn count(&self) -> u64 {
        match self {
            VisitorSet::Exact(set) => set.len() as u64,
            VisitorSet::Sketch(hll) => hll.estimate(),
        }
    }
}

/// Per-link distinct visitor counter
pub struct UniqueVisitorTracker {
    sets: DashMap<String, VisitorSet>,
    exact_threshold: usize,
    /// Position of the last stored event folded in by `sync_from`
    synced: Mutex<Option<EventCursor>>,
}

impl UniqueVisitorTracker {
    pub fn new(exact_threshold: usize) -> Self {
        Self {
            sets: DashMap::new(),
            exact_threshold,
            synced: Mutex::new(None),
        }
    }

    pub fn add(&self, link_id: &str, visitor_hash: &str) {
        let mut entry = self
            .sets
            .entry(link_id.to_string())
            .or_insert_with(|| VisitorSet::Exact(HashSet::new()));

        let replacement = match entry.value_mut() {
            VisitorSet::Exact(set) => {
                set.insert(visitor_hash.to_string());
                if set.len() > self.exact_threshold {
                    let mut hll = HyperLogLog::new();
                    for visitor in set.iter() {
                        hll.add(visitor);
                    }
                    debug!(link_id = %link_id, visitors = set.len(), "Switching visitor set to HyperLogLog");
                    Some(VisitorSet::Sketch(Box::new(hll)))
                } else {
                    None
                }
            }
            VisitorSet::Sketch(hll) => {
                hll.add(visitor_hash);
                None
            }
        };

        if let Some(sketch) = replacement {
            *entry.value_mut() = sketch;
        }
    }

    /// Approximate distinct visitors seen for a link (0 if never seen)
    pub fn count(&self, link_id: &str) -> u64 {
        self.sets.get(link_id).map(|s| s.value().count()).unwrap_or(0)
    }

    /// Fold in every stored event appended since the previous sync, paging
    /// in batches of `batch_size`. Returns how many events were read.
    ///
    /// Sets ignore repeats, so events already added through
    /// [`add`](Self::add) are harmless here.
    pub async fn sync_from(&self, store: &dyn EventStore, batch_size: usize) -> Result<u64> {
        let mut synced = self.synced.lock().await;
        let filter = EventFilter::all(None);
        let mut seen = 0u64;

        loop {
            let page = store.events_page(&filter, *synced, batch_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            *synced = Some(EventCursor::after(last));
            for event in &page {
                self.add(&event.link_id, &event.visitor_hash);
            }
            seen += page.len() as u64;
            if page.len() < batch_size {
                break;
            }
        }

        if seen > 0 {
            debug!(events = seen, "Visitor tracker synced");
        }
        Ok(seen)
    }

    /// Initial sync at startup
    pub async fn warm_from(&self, store: &dyn EventStore, batch_size: usize) -> Result<u64> {
        let seen = self.sync_from(store, batch_size).await?;
        info!(events = seen, links = self.sets.len(), "Visitor tracker warmed");
        Ok(seen)
    }
}

/// Derives visitor ids from client IPs with a secret salt
pub struct VisitorHasher {
    mac: Hmac<Sha256>,
}

impl VisitorHasher {
    /// Without a configured salt a random one is generated, so ids will not
    /// match across restarts.
    pub fn new(salt: Option<&str>) -> Result<Self> {
        let salt = match salt {
            Some(s) => s.as_bytes().to_vec(),
            None => rand::random::<[u8; 32]>().to_vec(),
        };
        let mac = Hmac::<Sha256>::new_from_slice(&salt)
            .map_err(|e| anyhow!("Failed to create HMAC: {}", e))?;
        Ok(Self { mac })
    }

    /// First 16 hex chars of HMAC-SHA256(salt, ip)
    pub fn hash(&self, ip: IpAddr) -> String {
        let mut mac = self.mac.clone();
        mac.update(ip.to_string().as_bytes());
        mac.finalize().into_bytes()[..8]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}
