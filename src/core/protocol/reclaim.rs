use log::{error, info, warn};
use crate::core::{
	chunk_key,
	peer::Peer,
	state::ChunkInfo,
	file_store::ChunkStore,
	channel::ChannelKind
};
use super::OpResult;

impl Peer {
	/// Limit the storage for other peers, evicting chunks above the limit.
	/// A negative limit means unlimited.
	pub async fn reclaim(&self, max_storage: i64) -> OpResult {
		self.state.set_max_storage(max_storage);
		if max_storage < 0 {
			return OpResult::ok("Storage is now unlimited");
		}

		let limit = max_storage as u64;
		let occupied = self.state.occupied_storage();
		if occupied <= limit {
			return OpResult::ok(format!("Storage limited to {} B, {} B in use", limit, occupied));
		}

		// smallest first, over-replicated ones first among equal sizes
		let mut victims = self.state.stored_chunks();
		victims.sort_by_key(|c| (c.size, c.perceived_degree <= c.desired_degree));

		let mut remaining = victims.iter().map(|c| c.size).sum::<u64>();
		let mut evicted = 0;
		let mut lost = Vec::new();
		for chunk in victims {
			if remaining <= limit {
				break;
			}
			remaining = remaining.saturating_sub(chunk.size);
			evicted += 1;
			let key = chunk_key(&chunk.file_id, chunk.chunk_no);
			if !self.evict_chunk(chunk).await {
				lost.push(key);
			}
		}
		info!("{}: evicted {} chunks", self.node(), evicted);
		let mut message = format!(
			"Evicted {} chunks, {} B in use of {} B",
			evicted,
			self.state.occupied_storage(),
			limit
		);
		if !lost.is_empty() {
			message.push_str(&format!(", could not replicate {} again", lost.join(", ")));
		}
		OpResult::ok(message)
	}

	// Returns false if the chunk could not be offered to other peers
	async fn evict_chunk(&self, chunk: ChunkInfo) -> bool {
		let data = match self.store.read_chunk(&chunk.file_id, chunk.chunk_no) {
			Ok(d) => Some(d),
			Err(e) => {
				error!("{}: evicting unreadable chunk {}:{}, it is not replicated again: {}", self.node(), chunk.file_id, chunk.chunk_no, e);
				None
			}
		};
		self.state.remove_chunk(&chunk.file_id, chunk.chunk_no);
		if let Err(e) = self.store.delete_chunk(&chunk.file_id, chunk.chunk_no) {
			warn!("{}: failed to delete chunk {}:{}: {}", self.node(), chunk.file_id, chunk.chunk_no, e);
		}
		self.broadcast(ChannelKind::Control, &self.factory.removed(&chunk.file_id, chunk.chunk_no)).await;

		// give the chunk a chance to find another home
		match data {
			Some(data) => {
				let tracker = self.trackers.stored.track();
				let peer = self.clone();
				tokio::spawn(async move { peer.reclaim_chunk_backup(chunk, data, tracker, false).await });
				true
			},
			None => false
		}
	}
}
