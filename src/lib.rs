pub mod api;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod logger;
pub mod replay;
pub mod state;
pub mod storage;

use sha2::{Digest, Sha256};

pub use engine::GuaranteeEngine;
pub use error::{Error, Result};

/// Calculate SHA256 digest
pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Generate a fresh row id (uuid v4, hyphenated).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
