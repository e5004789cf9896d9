use std::{collections::BTreeMap, sync::Arc};
use log::{debug, error, info, warn};
use tokio::time::sleep;
use crate::core::{
	chunk_key,
	random_delay,
	peer::Peer,
	state::{ChunkInfo, FileInfo},
	tracker::Tracker,
	channel::ChannelKind,
	error::{BackupError::*, BackupResult}
};
use super::{backoff, MAX_ATTEMPTS};

impl Peer {
	/// Broadcast the chunks of a file until each reaches the desired degree
	/// or the attempts run out. `floor` is the degree already obtained.
	/// A chunk nobody stored makes the whole file unrecoverable.
	pub(crate) async fn chunks_backup(&self, file_id: &str, chunks: &[Vec<u8>], desired: u32, floor: u32) -> BackupResult<BTreeMap<u32, u32>> {
		let tracker = self.trackers.stored.track();
		let base = self.config.putchunk_base_delay();
		let degree = |no: u32| floor.max(tracker.count(&chunk_key(file_id, no)) as u32);
		let mut pending: Vec<u32> = (0..chunks.len() as u32).collect();

		for attempt in 1..=MAX_ATTEMPTS {
			for &no in &pending {
				let message = self.factory.putchunk(file_id, no, desired, chunks[no as usize].clone());
				self.broadcast(ChannelKind::Backup, &message).await;
			}
			sleep(backoff(base, attempt)).await;
			pending.retain(|&no| degree(no) < desired);
			if pending.is_empty() {
				break;
			}
			debug!("{}: {} chunks of {} still short after attempt {}", self.node(), pending.len(), file_id, attempt);
		}

		let degrees: BTreeMap<u32, u32> = (0..chunks.len() as u32).map(|no| (no, degree(no))).collect();
		self.trackers.stored.dispose(&tracker);

		if let Some((&chunk_no, _)) = degrees.iter().find(|(_, &d)| d == 0) {
			error!("{}: chunk {} of {} was not stored by any peer", self.node(), chunk_no, file_id);
			self.delete_file(file_id).await;
			return Err(Unrecoverable {
				file_id: file_id.to_string(),
				chunk_no
			});
		}
		for no in pending {
			info!("{}: chunk {}:{} reached degree {} of {}", self.node(), file_id, no, degrees[&no], desired);
		}
		Ok(degrees)
	}

	/// Replicate one chunk again after a copy was removed.
	/// The tracker must be live and is disposed at the end.
	pub(crate) async fn reclaim_chunk_backup(&self, chunk: ChunkInfo, data: Vec<u8>, tracker: Arc<Tracker>, announce_own: bool) {
		let key = chunk_key(&chunk.file_id, chunk.chunk_no);
		let base = self.config.putchunk_base_delay();
		let desired = chunk.desired_degree as usize;
		let message = self.factory.putchunk(&chunk.file_id, chunk.chunk_no, chunk.desired_degree, data);
		let mut count = 0;

		for attempt in 1..=MAX_ATTEMPTS {
			self.broadcast(ChannelKind::Backup, &message).await;
			let delay = backoff(base, attempt);
			if announce_own && attempt == 1 {
				// this peer still holds a copy
				let jitter = random_delay(400, 0).min(delay);
				sleep(jitter).await;
				self.broadcast(ChannelKind::Control, &self.factory.stored(&chunk.file_id, chunk.chunk_no)).await;
				sleep(delay - jitter).await;
			}
			else {
				sleep(delay).await;
			}
			count = tracker.count(&key);
			if count >= desired {
				break;
			}
		}
		self.trackers.stored.dispose(&tracker);

		if count == 0 {
			error!("{}: no peer stored chunk {}", self.node(), key);
		}
		else if count < desired {
			warn!("{}: chunk {} replicated with degree {} of {}", self.node(), key, count, desired);
		}
		else {
			info!("{}: chunk {} replicated with degree {}", self.node(), key, count);
		}
		if announce_own {
			self.state.set_chunk_perceived(&chunk.file_id, chunk.chunk_no, count as u32);
		}
	}

	/// Ask every peer for the chunks of a file, retrying the missing ones
	pub(crate) async fn chunks_restore(&self, info: &FileInfo) -> BackupResult<Vec<Vec<u8>>> {
		let tracker = self.trackers.chunk.track();
		let keys: Vec<(u32, String)> = info.chunks.keys()
			.map(|&no| (no, chunk_key(&info.file_id, no)))
			.collect();
		for (_, key) in &keys {
			tracker.wait_for(key);
		}

		let base = self.config.getchunk_base_delay;
		for attempt in 1..=MAX_ATTEMPTS {
			let missing: Vec<u32> = keys.iter()
				.filter(|(_, key)| !tracker.has_payload(key))
				.map(|(no, _)| *no)
				.collect();
			if missing.is_empty() {
				break;
			}
			for no in missing {
				self.broadcast(ChannelKind::Control, &self.factory.getchunk(&info.file_id, no)).await;
			}
			sleep(backoff(base, attempt)).await;
		}

		let mut parts = Vec::with_capacity(keys.len());
		let mut missing = Vec::new();
		for (no, key) in &keys {
			match tracker.take_payload(key) {
				Some(data) => parts.push(data),
				None => missing.push(*no)
			}
		}
		self.trackers.chunk.dispose(&tracker);
		if missing.is_empty() {
			Ok(parts)
		}
		else {
			Err(MissingChunks(missing))
		}
	}
}
