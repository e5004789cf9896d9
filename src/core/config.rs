use std::{default::Default, path::PathBuf};
use super::message::ProtocolVersion;

#[derive(Clone, Debug)]
pub struct Config {
	/// Protocol version spoken by this peer (1.0 vanilla, 1.1 enhanced)
	pub version: ProtocolVersion,
	/// Directory for stored chunks, restored files and the state snapshot
	pub root_dir: PathBuf,
	// interval in ms (0 means disabling it)
	pub stabilize_interval: u64,
	pub fix_finger_interval: u64,
	pub check_predecessor_interval: u64,
	pub successor_list_interval: u64,
	/// max number of concurrent connections buffered
	pub max_connections: u64,
	/// max number of broadcast messages handled concurrently per channel
	pub max_workers: usize,
	/// Base delay in ms of the PUTCHUNK backoff.
	/// Derived from the protocol version when unset.
	pub putchunk_base_delay: Option<u64>,
	/// Base delay in ms of the GETCHUNK backoff
	pub getchunk_base_delay: u64,
	/// Idle timeout in ms while collecting the parts of a file
	pub bucket_idle_timeout: u64,
	/// How long in ms a stored chunk keeps listening for STORED acknowledgements
	pub tracker_lifetime: u64,
	/// How long in ms after a DELETE further PUTCHUNKs of the file are ignored.
	/// Later ones are a new backup of it.
	pub delete_grace: u64,
	/// Ask the network on start whether stored files were deleted meanwhile
	pub check_deleted_on_start: bool
}

impl Config {
	pub fn putchunk_base_delay(&self) -> u64 {
		match self.putchunk_base_delay {
			Some(d) => d,
			None if self.version.is_vanilla() => 1000,
			None => 3000
		}
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			version: ProtocolVersion::VANILLA,
			root_dir: PathBuf::from("peer"),
			stabilize_interval: 250,
			fix_finger_interval: 250,
			check_predecessor_interval: 1000,
			successor_list_interval: 1000,
			max_connections: 16,
			max_workers: 16,
			putchunk_base_delay: None,
			getchunk_base_delay: 1000,
			bucket_idle_timeout: 5000,
			tracker_lifetime: 10000,
			// outlasts the enhanced PUTCHUNK backoff
			delete_grace: 120000,
			check_deleted_on_start: true
		}
	}
}
