//! Partition selection for records without an explicit partition
//!
//! - **With key**: murmur2 hash of the key, so equal keys land on the same partition
//! - **Without key**: per-topic round-robin

use parking_lot::Mutex;
use std::collections::HashMap;

/// Chooses partitions for records that do not name one
#[derive(Debug, Default)]
pub struct Partitioner {
    next: Mutex<HashMap<String, u32>>,
}

impl Partitioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, topic: &str, key: Option<&[u8]>, num_partitions: u32) -> u32 {
        if num_partitions == 0 {
            return 0;
        }
        match key {
            Some(key) => (murmur2(key) & 0x7fff_ffff) % num_partitions,
            None => {
                let mut next = self.next.lock();
                let counter = next.entry(topic.to_string()).or_insert(0);
                let partition = *counter % num_partitions;
                *counter = counter.wrapping_add(1);
                partition
            }
        }
    }
}

/// Kafka-compatible murmur2
fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = SEED ^ data.len() as u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}
