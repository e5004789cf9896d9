pub mod ring;
pub mod config;
pub mod error;
pub mod message;
pub mod tracker;
pub mod state;
pub mod file_store;
pub mod bucket;
pub mod channel;
pub mod chord;
pub mod strategy;
pub mod peer;
pub mod handler;
pub mod protocol;

pub use ring::*;
pub use config::*;
pub use error::*;
pub use peer::Peer;

use std::{path::Path, time::{Duration, UNIX_EPOCH}};
use rand::Rng;
use sha2::{Digest as _, Sha256};

/// Largest chunk body in bytes
pub const MAX_CHUNK_SIZE: usize = 64000;
/// Largest chunk number
pub const MAX_CHUNK_NO: u32 = 999_999;

pub fn calculate_hash(data: &[u8]) -> Digest {
	let hash = Sha256::digest(data);
	u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
}

pub fn construct_node(addr: &str) -> ChordNode {
	ChordNode {
		addr: addr.to_string(),
		id: calculate_hash(addr.as_bytes())
	}
}

/// Key used by the trackers and the state for one chunk
pub fn chunk_key(file_id: &str, chunk_no: u32) -> String {
	format!("{}:{}", file_id, chunk_no)
}

/// File id derived from the path and its metadata,
/// so a modified file gets a new id
pub fn generate_file_id(path: &Path) -> BackupResult<String> {
	let metadata = std::fs::metadata(path)?;
	let modified = metadata.modified()?
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_nanos();
	let mut hasher = Sha256::new();
	hasher.update(path.to_string_lossy().as_bytes());
	hasher.update(modified.to_string().as_bytes());
	hasher.update(metadata.len().to_string().as_bytes());
	Ok(hex::encode(hasher.finalize()))
}

/// Split data into chunks.
/// A file whose size is a multiple of the chunk size ends with an empty chunk.
pub fn split_chunks(data: &[u8]) -> Vec<Vec<u8>> {
	let mut chunks: Vec<Vec<u8>> = data.chunks(MAX_CHUNK_SIZE)
		.map(|c| c.to_vec())
		.collect();
	if data.len() % MAX_CHUNK_SIZE == 0 {
		chunks.push(Vec::new());
	}
	chunks
}

/// Random delay in [offset, offset + bound) ms
pub fn random_delay(bound: u64, offset: u64) -> Duration {
	let jitter = if bound == 0 { 0 } else { rand::thread_rng().gen_range(0..bound) };
	Duration::from_millis(offset + jitter)
}
