//! Initialization vector pool.
//!
//! Draws IVs from the OS RNG in batches so a busy listener pays for one
//! RNG call per batch instead of one per message.

use std::sync::Mutex;

use rand::RngCore;
use rand::rngs::OsRng;

pub const IV_LEN: usize = 16;

const DEFAULT_BATCH: usize = 64;

pub struct IvPool {
    pool: Mutex<Vec<[u8; IV_LEN]>>,
    batch: usize,
}

impl IvPool {
    pub fn new() -> Self {
        Self::with_batch(DEFAULT_BATCH)
    }

    pub fn with_batch(batch: usize) -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
            batch: batch.max(1),
        }
    }

    /// Take a fresh IV. Each IV is handed out once.
    pub fn next(&self) -> [u8; IV_LEN] {
        let mut pool = self.pool.lock().expect("iv pool lock");
        if pool.is_empty() {
            let mut buf = vec![0u8; IV_LEN * self.batch];
            OsRng.fill_bytes(&mut buf);
            pool.extend(buf.chunks_exact(IV_LEN).map(|chunk| {
                let mut iv = [0u8; IV_LEN];
                iv.copy_from_slice(chunk);
                iv
            }));
        }
        pool.pop().unwrap_or_else(|| {
            let mut iv = [0u8; IV_LEN];
            OsRng.fill_bytes(&mut iv);
            iv
        })
    }
}

impl Default for IvPool {
    fn default() -> Self {
        Self::new()
    }
}
