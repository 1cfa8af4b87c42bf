//! Transient instruction store with HMAC-signed keys.
//!
//! Holds instruction documents between materialization and sandbox launch
//! so providers without a shared filesystem can fetch them through the
//! internal HTTP API. Keys are HMAC-SHA256 signed: a sandbox can only fetch
//! the instruction it was launched with, and cannot guess another task's
//! key.
//!
//! Capacity is capped at 50 entries; hitting the cap clears the whole map
//! (entries are transient and re-materialized on retry). Each key has a
//! single writer.

use std::collections::HashMap;
use std::sync::Mutex;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum entries held before the store evicts everything.
const CAPACITY: usize = 50;

/// Keyed map of instruction documents plus captured sandbox outputs.
#[derive(Debug)]
pub struct InstructionStore {
    secret: Vec<u8>,
    instructions: Mutex<HashMap<String, String>>,
    outputs: Mutex<HashMap<String, String>>,
}

impl InstructionStore {
    /// Create a store with the given signing secret.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            instructions: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
        }
    }

    /// Create a store with a random per-process secret.
    pub fn with_random_secret() -> Self {
        use rand::Rng;
        let mut secret = vec![0u8; 32];
        rand::rng().fill(secret.as_mut_slice());
        Self::new(secret)
    }

    /// Derive the signed key for a task attempt.
    ///
    /// The key is stable for a `(task_id, iteration)` pair so a retry gets a
    /// fresh key and a stale sandbox cannot fetch the new attempt's
    /// instruction.
    pub fn sign_key(&self, task_id: &str, iteration: u32) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(task_id.as_bytes());
        mac.update(b":");
        mac.update(iteration.to_string().as_bytes());
        let digest = mac.finalize().into_bytes();
        format!("{task_id}.{}", hex::encode(&digest[..16]))
    }

    /// Verify that a key was produced by [`Self::sign_key`].
    pub fn verify_key(&self, key: &str) -> bool {
        let instructions = self.instructions.lock().unwrap_or_else(|e| e.into_inner());
        instructions.contains_key(key)
    }

    /// Store an instruction under its signed key. Clears the whole store
    /// first when the cap is reached.
    pub fn put_instruction(&self, key: &str, instruction: &str) {
        let mut instructions = self.instructions.lock().unwrap_or_else(|e| e.into_inner());
        if instructions.len() >= CAPACITY {
            tracing::warn!(
                len = instructions.len(),
                "instruction store full, clearing all entries"
            );
            instructions.clear();
            self.outputs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        }
        instructions.insert(key.to_owned(), instruction.to_owned());
    }

    /// Fetch an instruction by signed key.
    pub fn get_instruction(&self, key: &str) -> Option<String> {
        let instructions = self.instructions.lock().unwrap_or_else(|e| e.into_inner());
        instructions.get(key).cloned()
    }

    /// Remove an instruction (teardown cleanup).
    pub fn remove_instruction(&self, key: &str) {
        let mut instructions = self.instructions.lock().unwrap_or_else(|e| e.into_inner());
        instructions.remove(key);
    }

    /// Record output written back by a sandbox through the internal API.
    ///
    /// Rejected unless the key corresponds to a stored instruction.
    pub fn put_output(&self, key: &str, output: &str) -> bool {
        if !self.verify_key(key) {
            return false;
        }
        let mut outputs = self.outputs.lock().unwrap_or_else(|e| e.into_inner());
        outputs.insert(key.to_owned(), output.to_owned());
        true
    }

    /// Fetch output written back by a sandbox.
    pub fn get_output(&self, key: &str) -> Option<String> {
        let outputs = self.outputs.lock().unwrap_or_else(|e| e.into_inner());
        outputs.get(key).cloned()
    }

    /// Number of stored instructions.
    pub fn len(&self) -> usize {
        self.instructions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
