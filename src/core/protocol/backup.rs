use std::{collections::BTreeMap, path::Path};
use log::{debug, error, info, warn};
use crate::core::{
	calculate_hash,
	generate_file_id,
	split_chunks,
	MAX_CHUNK_NO,
	peer::Peer,
	ring::{ChordNode, Digest},
	state::FileInfo,
	file_store::ChunkStore,
	message::MessageType,
	error::{BackupError::*, BackupResult}
};
use super::{OpResult, MAX_ROUTING_STEPS};

impl Peer {
	/// Back up a local file with the desired replication degree
	pub async fn backup(&self, path: &Path, desired: u32) -> OpResult {
		if desired == 0 {
			return OpResult::failed("Replication degree must be at least 1");
		}
		match self.try_backup(path, desired).await {
			Ok(result) => result,
			Err(e) => {
				error!("{}: backup of {} failed: {}", self.node(), path.display(), e);
				OpResult::failed(format!("Backup of {} failed: {}", path.display(), e))
			}
		}
	}

	async fn try_backup(&self, path: &Path, desired: u32) -> BackupResult<OpResult> {
		let data = self.store.read_file(path)?;
		let file_id = generate_file_id(path)?;
		let file_name = match path.file_name() {
			Some(name) => name.to_string_lossy().into_owned(),
			None => path.to_string_lossy().into_owned()
		};
		let chunks = split_chunks(&data);
		if chunks.len() > MAX_CHUNK_NO as usize + 1 {
			return Err(TooManyChunks(file_name));
		}

		// the last backup of a name replaces the previous one
		if let Some(previous) = self.state.file_by_name(&file_name) {
			if previous.file_id != file_id {
				info!("{}: {} changed, deleting its previous backup", self.node(), file_name);
				self.delete_file(&previous.file_id).await;
			}
		}
		self.state.remove_deleted(&file_id);

		let key = calculate_hash(file_id.as_bytes());
		let ring_degree = match self.place_file(&file_id, key, &chunks, desired).await {
			Ok(d) => d,
			Err(e) => {
				warn!("{}: failed to place {} on the ring: {}", self.node(), file_name, e);
				0
			}
		};
		debug!("{}: {} placed on {} ring nodes", self.node(), file_name, ring_degree);

		let degrees: BTreeMap<u32, u32> = if ring_degree >= desired {
			(0..chunks.len() as u32).map(|no| (no, ring_degree)).collect()
		}
		else {
			match self.chunks_backup(&file_id, &chunks, desired, ring_degree).await {
				Ok(d) => d,
				Err(e @ Unrecoverable { .. }) => {
					return Ok(OpResult::failed(format!("Couldn't back up {}: {}", file_name, e)));
				},
				Err(e) => return Err(e)
			}
		};

		let perceived = degrees.values().copied().min().unwrap_or(0);
		self.state.add_file(FileInfo {
			file_name: file_name.clone(),
			file_id,
			desired_degree: desired,
			byte_amount: data.len() as u64,
			chunks: degrees
		});

		if perceived < desired {
			info!("{}: {} backed up below its desired degree", self.node(), file_name);
			Ok(OpResult::ok(format!(
				"File {} backed up with perceived replication degree {} (desired {})",
				file_name, perceived, desired
			)))
		}
		else {
			Ok(OpResult::ok(format!("File {} backed up with replication degree {}", file_name, perceived)))
		}
	}

	/// Place whole copies of a file on consecutive ring nodes,
	/// starting at the node responsible for its key.
	/// Returns how many nodes hold it.
	async fn place_file(&self, file_id: &str, key: Digest, chunks: &[Vec<u8>], desired: u32) -> BackupResult<u32> {
		let byte_amount = chunks.iter().map(|c| c.len() as u64).sum();
		let parts = chunks.len() as u32;
		let mut dest = self.chord.lookup(key).await?;
		let first = dest.id;
		let mut perceived = 0;
		// every redirecting node, and those since the last node that took the file
		let mut pointers: Vec<ChordNode> = Vec::new();
		let mut trailing: Vec<ChordNode> = Vec::new();
		let mut transfers = Vec::new();

		for step in 0..MAX_ROUTING_STEPS {
			if perceived >= desired || (step > 0 && dest.id == first) {
				break;
			}
			// a peer holds its own file only when alone
			if dest.id == self.id() && !self.chord.is_alone() {
				dest = self.chord.get_successor();
				continue;
			}

			let message = self.factory.putfile(file_id, parts, desired, perceived, byte_amount);
			let reply = match self.request(&dest, message).await {
				Ok(r) => r,
				Err(e) => {
					warn!("{}: {} did not take file {}: {}", self.node(), dest, file_id, e);
					break;
				}
			};
			match reply.kind {
				MessageType::Redirect => {
					pointers.push(dest.clone());
					trailing.push(dest.clone());
					dest = reply.node()?.clone();
					continue;
				},
				MessageType::ProcessedYes => {
					let peer = self.clone();
					let node = dest.clone();
					let id = file_id.to_string();
					let parts = chunks.to_vec();
					transfers.push(tokio::spawn(async move { peer.send_parts(&node, &id, parts).await }));
					perceived += 1;
					trailing.clear();
				},
				// already there
				MessageType::ProcessedNo => {
					perceived += 1;
					trailing.clear();
				},
				kind => return Err(UnexpectedReply(kind))
			}

			dest = match self.chord.successor_of(&dest).await {
				Ok(n) => n,
				Err(e) => {
					warn!("{}: ring walk stopped at {}: {}", self.node(), dest, e);
					break;
				}
			};
		}

		for transfer in transfers {
			match transfer.await {
				Ok(Ok(())) => (),
				Ok(Err(e)) => {
					warn!("{}: transfer of file {} failed: {}", self.node(), file_id, e);
					perceived -= 1;
				},
				Err(e) => {
					warn!("{}: transfer of file {} panicked: {}", self.node(), file_id, e);
					perceived -= 1;
				}
			}
		}

		// pointers past the last holder lead nowhere, all of them if nobody took the file
		let dangling = if perceived == 0 { pointers } else { trailing };
		for node in dangling {
			if node.id == self.id() {
				self.state.remove_pointer(file_id);
			}
			else if let Err(e) = self.connections.send(&node, &self.factory.remove_pointer(file_id)).await {
				warn!("{}: failed to remove pointer at {}: {}", self.node(), node, e);
			}
		}
		Ok(perceived)
	}

	async fn send_parts(&self, node: &ChordNode, file_id: &str, parts: Vec<Vec<u8>>) -> BackupResult<()> {
		for (order, part) in parts.into_iter().enumerate() {
			let reply = self.request(node, self.factory.data(file_id, order as u32, part)).await?;
			if reply.kind != MessageType::ProcessedYes {
				return Err(UnexpectedReply(reply.kind));
			}
		}
		debug!("{}: sent file {} to {}", self.node(), file_id, node);
		Ok(())
	}
}
