use std::{path::PathBuf, sync::Arc, time::Duration};
use log::{error, info, warn};
use tokio::{sync::oneshot, time::timeout};
use crate::core::{
	calculate_hash,
	peer::Peer,
	bucket::FileBucket,
	state::FileInfo,
	file_store::ChunkStore,
	message::MessageType,
	error::{BackupError::*, BackupResult}
};
use super::{OpResult, MAX_ROUTING_STEPS};

impl Peer {
	/// Restore a backed up file into the restored directory
	pub async fn restore(&self, file_name: &str) -> OpResult {
		let info = match self.state.file_by_name(file_name) {
			Some(info) => info,
			None => return OpResult::failed(format!("File {} was never backed up by this peer", file_name))
		};
		match self.try_restore(&info).await {
			Ok(path) => OpResult::ok(format!("File {} restored to {}", file_name, path.display())),
			Err(e) => {
				error!("{}: restore of {} failed: {}", self.node(), file_name, e);
				OpResult::failed(format!("Restore of {} failed: {}", file_name, e))
			}
		}
	}

	async fn try_restore(&self, info: &FileInfo) -> BackupResult<PathBuf> {
		let parts = match self.fetch_file(info).await? {
			Some(parts) => parts,
			None => {
				info!("{}: no ring node sent {}, asking for its chunks", self.node(), info.file_name);
				self.chunks_restore(info).await?
			}
		};
		Ok(self.store.write_file(&info.file_name, &parts)?)
	}

	/// Get a whole copy from a ring node holding the file
	async fn fetch_file(&self, info: &FileInfo) -> BackupResult<Option<Vec<Vec<u8>>>> {
		let (tx, rx) = oneshot::channel();
		let bucket = Arc::new(FileBucket::new(info.chunks.len(), move |parts| {
			let _ = tx.send(parts);
		}));
		self.buckets.insert(&info.file_id, bucket.clone());

		let parts = match self.find_holder(&info.file_id).await {
			Ok(true) => self.collect(&bucket, rx).await,
			Ok(false) => None,
			Err(e) => {
				self.buckets.remove(&info.file_id);
				return Err(e);
			}
		};
		self.buckets.remove(&info.file_id);
		Ok(parts)
	}

	// Walk the ring until a node agrees to send the file
	async fn find_holder(&self, file_id: &str) -> BackupResult<bool> {
		let key = calculate_hash(file_id.as_bytes());
		let mut dest = self.chord.lookup(key).await?;
		let first = dest.id;

		for step in 0..MAX_ROUTING_STEPS {
			if step > 0 && dest.id == first {
				return Ok(false);
			}
			let reply = self.request(&dest, self.factory.getfile(file_id, self.node().clone())).await?;
			match reply.kind {
				MessageType::ProcessedYes => return Ok(true),
				MessageType::ProcessedNo => dest = self.chord.successor_of(&dest).await?,
				MessageType::Redirect => dest = reply.node()?.clone(),
				kind => return Err(UnexpectedReply(kind))
			}
		}
		Err(RoutingExhausted(key))
	}

	async fn collect(&self, bucket: &FileBucket, mut rx: oneshot::Receiver<Vec<Vec<u8>>>) -> Option<Vec<Vec<u8>>> {
		let idle = Duration::from_millis(self.config.bucket_idle_timeout);
		loop {
			match timeout(idle, &mut rx).await {
				Ok(Ok(parts)) => return Some(parts),
				Ok(Err(_)) => return None,
				Err(_) if bucket.idle_for() >= idle => {
					warn!("{}: transfer went idle", self.node());
					return None;
				},
				Err(_) => ()
			}
		}
	}
}
