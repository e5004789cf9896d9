pub mod backup;
pub mod chunks;
pub mod restore;
pub mod delete;
pub mod reclaim;

use std::{fmt, time::Duration};
use serde::{Serialize, Deserialize};

/// Rounds of PUTCHUNK and GETCHUNK before giving up
pub const MAX_ATTEMPTS: u32 = 5;
/// Bound on ring hops while placing or fetching a file
pub const MAX_ROUTING_STEPS: usize = 500;

/// Outcome of a client operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResult {
	pub success: bool,
	pub message: String
}

impl OpResult {
	pub fn ok(message: impl Into<String>) -> Self {
		Self {
			success: true,
			message: message.into()
		}
	}

	pub fn failed(message: impl Into<String>) -> Self {
		Self {
			success: false,
			message: message.into()
		}
	}
}

impl fmt::Display for OpResult {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let status = if self.success { "OK" } else { "FAILED" };
		write!(f, "[{}] {}", status, self.message)
	}
}

// attempt k waits base * 2^(k-1)
pub(crate) fn backoff(base: u64, attempt: u32) -> Duration {
	Duration::from_millis(base << (attempt.max(1) - 1))
}
