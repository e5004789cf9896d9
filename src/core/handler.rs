use std::{
	io,
	net::{IpAddr, SocketAddr},
	sync::Arc,
	time::Duration
};
use futures::{future::BoxFuture, FutureExt};
use log::{debug, info, warn};
use tokio::{
	io::AsyncReadExt,
	net::TcpStream,
	time::{sleep, timeout}
};
use super::{
	random_delay,
	peer::Peer,
	chord::Route,
	ring::ChordNode,
	channel::ChannelKind,
	bucket::FileBucket,
	state::ChunkInfo,
	tracker::Tracker,
	file_store::ChunkStore,
	strategy::CHUNK_SOCKET_TIMEOUT,
	message::{Message, MessageType, ParseError},
	error::BackupResult
};

// anti-collision delay in ms before answering on a shared channel
const ANSWER_JITTER: u64 = 400;

impl Peer {
	/// React to a ring message, returning the reply if any
	pub fn handle_request(&self, message: Message) -> BoxFuture<'static, Option<Message>> {
		let peer = self.clone();
		async move {
			debug!("{}: received {}", peer.node(), message);
			match peer.dispatch_request(message).await {
				Ok(reply) => reply,
				Err(e) => {
					warn!("{}: dropping request: {}", peer.node(), e);
					None
				}
			}
		}.boxed()
	}

	async fn dispatch_request(&self, message: Message) -> BackupResult<Option<Message>> {
		let reply = match message.kind {
			MessageType::Lookup => Some(match self.chord.route(message.key()?) {
				Route::Found(n) => self.factory.node(Some(n)),
				Route::Next(n) => self.factory.redirect(n)
			}),
			MessageType::GetPredecessor => Some(self.factory.node(self.chord.get_predecessor())),
			MessageType::GetSuccessor => Some(self.factory.node(Some(self.chord.get_successor()))),
			MessageType::Notify => {
				self.chord.notify(message.node()?.clone());
				None
			},
			MessageType::Putfile => Some(self.put_file(&message)?),
			MessageType::Data => Some(self.receive_data(message)?),
			MessageType::Getfile => Some(self.get_file(&message)?),
			MessageType::RemovePointer => {
				self.state.remove_pointer(message.file_id()?);
				None
			},
			kind => {
				warn!("{}: {} is not a ring request", self.node(), kind);
				None
			}
		};
		Ok(reply)
	}

	// Accept a whole file, or send the backup further along the ring
	fn put_file(&self, message: &Message) -> BackupResult<Message> {
		let file_id = message.file_id()?;
		let parts = message.parts()?;
		let desired = message.replication_degree()?;
		let perceived = message.perceived_degree()?;
		let byte_amount = message.byte_amount()?;

		// a new backup revives a deleted file
		self.state.remove_deleted(file_id);
		if self.state.has_file_chunks(file_id) || self.buckets.contains(file_id) {
			return Ok(self.factory.processed(false));
		}
		if self.state.owns_file(file_id) || !self.state.has_space_for(byte_amount) {
			self.state.add_pointer(file_id);
			return Ok(self.factory.redirect(self.chord.get_successor()));
		}

		let peer = self.clone();
		let id = file_id.to_string();
		let bucket = FileBucket::new(parts as usize, move |chunks| {
			peer.store_file(&id, chunks, desired, perceived + 1);
		});
		self.buckets.insert(file_id, Arc::new(bucket));
		self.buckets.expire_when_idle(file_id, Duration::from_millis(self.config.bucket_idle_timeout));
		debug!("{}: expecting {} parts of file {}", self.node(), parts, file_id);
		Ok(self.factory.processed(true))
	}

	fn store_file(&self, file_id: &str, chunks: Vec<Vec<u8>>, desired: u32, perceived: u32) {
		let mut stored = 0;
		for (chunk_no, data) in chunks.iter().enumerate() {
			match self.store_chunk(file_id, chunk_no as u32, data, desired, perceived) {
				Ok(true) => stored += 1,
				Ok(false) => warn!("{}: no room left for chunk {}:{}", self.node(), file_id, chunk_no),
				Err(e) => warn!("{}: failed to store chunk {}:{}: {}", self.node(), file_id, chunk_no, e)
			}
		}
		info!("{}: stored {} of {} chunks of file {}", self.node(), stored, chunks.len(), file_id);
	}

	/// Admit a chunk into the quota and write it to disk
	pub(crate) fn store_chunk(&self, file_id: &str, chunk_no: u32, data: &[u8], desired: u32, perceived: u32) -> BackupResult<bool> {
		let info = ChunkInfo {
			file_id: file_id.to_string(),
			chunk_no,
			size: data.len() as u64,
			desired_degree: desired,
			perceived_degree: perceived
		};
		if !self.state.admit_chunk(info) {
			return Ok(false);
		}
		if let Err(e) = self.store.write_chunk(file_id, chunk_no, data) {
			self.state.remove_chunk(file_id, chunk_no);
			return Err(e.into());
		}
		Ok(true)
	}

	fn receive_data(&self, message: Message) -> BackupResult<Message> {
		let file_id = message.file_id()?.to_string();
		let order = message.chunk_no()?;
		let accepted = self.buckets.add_part(&file_id, order, message.into_body()?);
		if !accepted {
			warn!("{}: no transfer of file {} in progress", self.node(), file_id);
		}
		Ok(self.factory.processed(accepted))
	}

	fn get_file(&self, message: &Message) -> BackupResult<Message> {
		let file_id = message.file_id()?;
		let requester = message.node()?.clone();

		if self.state.has_file_chunks(file_id) {
			let peer = self.clone();
			let file_id = file_id.to_string();
			tokio::spawn(async move { peer.send_file(&file_id, requester).await });
			Ok(self.factory.processed(true))
		}
		else if self.state.is_pointer(file_id) {
			Ok(self.factory.redirect(self.chord.get_successor()))
		}
		else {
			Ok(self.factory.processed(false))
		}
	}

	async fn send_file(&self, file_id: &str, requester: ChordNode) {
		for chunk in self.state.file_chunks(file_id) {
			let data = match self.store.read_chunk(file_id, chunk.chunk_no) {
				Ok(d) => d,
				Err(e) => {
					warn!("{}: cannot read chunk {}:{}: {}", self.node(), file_id, chunk.chunk_no, e);
					return;
				}
			};
			let message = self.factory.data(file_id, chunk.chunk_no, data);
			if let Err(e) = self.request(&requester, message).await {
				warn!("{}: failed to send file {} to {}: {}", self.node(), file_id, requester, e);
				return;
			}
		}
	}

	/// React to a message from a broadcast channel
	pub(crate) fn handle_broadcast(&self, kind: ChannelKind, data: Vec<u8>, sender: IpAddr) -> BoxFuture<'static, ()> {
		let peer = self.clone();
		async move {
			let message = match Message::decode(&data) {
				Ok(m) => m,
				Err(e) => {
					warn!("{}: dropping malformed message on {} channel: {}", peer.node(), kind, e);
					return;
				}
			};
			// own messages come back on multicast
			if message.sender_id == peer.id() {
				return;
			}
			debug!("{}: received {} on {} channel", peer.node(), message, kind);

			let result = match (kind, message.kind) {
				(ChannelKind::Control, MessageType::Stored) => peer.on_stored(&message),
				(ChannelKind::Control, MessageType::Getchunk) => peer.on_getchunk(&message).await,
				(ChannelKind::Control, MessageType::Delete) => peer.on_delete(&message),
				(ChannelKind::Control, MessageType::Removed) => peer.on_removed(&message).await,
				(ChannelKind::Control, MessageType::Filecheck) => peer.on_filecheck(&message).await,
				(ChannelKind::Backup, MessageType::Putchunk) => peer.on_putchunk(&message).await,
				(ChannelKind::Restore, MessageType::Chunk) => peer.on_chunk(&message, sender).await,
				(kind, message_kind) => {
					warn!("{}: unexpected {} on {} channel", peer.node(), message_kind, kind);
					Ok(())
				}
			};
			if let Err(e) = result {
				warn!("{}: failed to handle {}: {}", peer.node(), message, e);
			}
		}.boxed()
	}

	fn on_stored(&self, message: &Message) -> BackupResult<()> {
		self.trackers.stored.record(&message.chunk_key()?, message.sender_id);
		Ok(())
	}

	async fn on_putchunk(&self, message: &Message) -> BackupResult<()> {
		let file_id = message.file_id()?;
		let chunk_no = message.chunk_no()?;
		let key = message.chunk_key()?;
		self.trackers.putchunk.record(&key, message.sender_id);

		if self.state.deleted_within(file_id, Duration::from_millis(self.config.delete_grace)) {
			debug!("{}: ignoring chunk {} of deleted file", self.node(), key);
			return Ok(());
		}
		// a backup long after the deletion revives the file
		self.state.remove_deleted(file_id);
		if self.state.has_chunk(file_id, chunk_no) {
			self.backup_strategy.announce_stored(self, file_id, chunk_no).await;
			return Ok(());
		}
		if self.state.owns_file(file_id) || !self.state.has_space_for(message.body()?.len() as u64) {
			return Ok(());
		}
		let tracker = self.trackers.stored.track();
		self.backup_strategy.store(self, message, tracker).await
	}

	/// Store the chunk of a PUTCHUNK, counting this peer in the tracker.
	/// Returns false if it did not fit.
	pub(crate) fn commit_putchunk(&self, message: &Message, tracker: &Arc<Tracker>) -> BackupResult<bool> {
		let file_id = message.file_id()?;
		let chunk_no = message.chunk_no()?;
		let key = message.chunk_key()?;
		// this peer and the acknowledgements seen so far
		let perceived = tracker.count(&key) as u32 + 1;
		if !self.store_chunk(file_id, chunk_no, message.body()?, message.replication_degree()?, perceived)? {
			return Ok(false);
		}
		self.trackers.stored.record(&key, self.id());

		let state = self.state.clone();
		let id = file_id.to_string();
		tracker.add_notifier(&key, move |count| state.raise_chunk_perceived(&id, chunk_no, count as u32));
		info!("{}: stored chunk {}", self.node(), key);
		Ok(true)
	}

	async fn on_getchunk(&self, message: &Message) -> BackupResult<()> {
		let file_id = message.file_id()?;
		let chunk_no = message.chunk_no()?;
		let key = message.chunk_key()?;
		// silence for chunks not held here
		if !self.state.has_chunk(file_id, chunk_no) {
			return Ok(());
		}

		let tracker = self.trackers.chunk.track();
		sleep(random_delay(ANSWER_JITTER, 0)).await;
		let answered = tracker.contains(&key);
		self.trackers.chunk.dispose(&tracker);
		if answered {
			debug!("{}: chunk {} already sent by another peer", self.node(), key);
			return Ok(());
		}
		self.restore_strategy.send_chunk(self, message).await
	}

	async fn on_chunk(&self, message: &Message, sender: IpAddr) -> BackupResult<()> {
		let key = message.chunk_key()?;
		if message.version.is_vanilla() {
			self.trackers.chunk.record_payload(&key, message.sender_id, Some(message.body()?));
			return Ok(());
		}
		if !self.trackers.chunk.is_waiting(&key) {
			self.trackers.chunk.record_payload(&key, message.sender_id, None);
			return Ok(());
		}

		let body = message.body()?;
		let port: u16 = std::str::from_utf8(body).ok()
			.and_then(|s| s.trim().parse().ok())
			.ok_or_else(|| ParseError::InvalidField {
				field: "port",
				value: String::from_utf8_lossy(body).into_owned()
			})?;
		let data = fetch_chunk(SocketAddr::new(sender, port)).await?;
		debug!("{}: fetched chunk {} ({} B)", self.node(), key, data.len());
		self.trackers.chunk.record_payload(&key, message.sender_id, Some(&data));
		Ok(())
	}

	fn on_delete(&self, message: &Message) -> BackupResult<()> {
		let file_id = message.file_id()?;
		self.trackers.delete.record(file_id, message.sender_id);
		self.purge_file(file_id);
		self.state.add_deleted(file_id);
		Ok(())
	}

	/// Drop every local copy of a file
	pub(crate) fn purge_file(&self, file_id: &str) -> usize {
		let chunks = self.state.remove_file_chunks(file_id);
		if let Err(e) = self.store.delete_file_chunks(file_id) {
			warn!("{}: failed to delete chunks of file {}: {}", self.node(), file_id, e);
		}
		self.state.remove_pointer(file_id);
		if !chunks.is_empty() {
			info!("{}: purged {} chunks of file {}", self.node(), chunks.len(), file_id);
		}
		chunks.len()
	}

	async fn on_removed(&self, message: &Message) -> BackupResult<()> {
		let file_id = message.file_id()?;
		let chunk_no = message.chunk_no()?;
		let key = message.chunk_key()?;

		if self.state.owns_file(file_id) {
			self.state.decrement_file_chunk_perceived(file_id, chunk_no);
			// count the peers that replace the removed copy
			let tracker = self.trackers.stored.track();
			let state = self.state.clone();
			let id = file_id.to_string();
			tracker.add_notifier(&key, move |_| state.increment_file_chunk_perceived(&id, chunk_no));
			self.dispose_stored_later(tracker);
			return Ok(());
		}

		let chunk = match self.state.chunk(file_id, chunk_no) {
			Some(c) => c,
			None => return Ok(())
		};
		let perceived = self.state.decrement_chunk_perceived(file_id, chunk_no).unwrap_or(0);
		if perceived >= chunk.desired_degree {
			return Ok(());
		}

		let stored = self.trackers.stored.track();
		let putchunks = self.trackers.putchunk.track();
		sleep(random_delay(ANSWER_JITTER, 0)).await;
		let superseded = putchunks.contains(&key);
		self.trackers.putchunk.dispose(&putchunks);
		if superseded {
			debug!("{}: chunk {} is already being replicated", self.node(), key);
			self.trackers.stored.dispose(&stored);
			return Ok(());
		}

		let data = match self.store.read_chunk(file_id, chunk_no) {
			Ok(d) => d,
			Err(e) => {
				self.trackers.stored.dispose(&stored);
				return Err(e.into());
			}
		};
		self.trackers.stored.record(&key, self.id());
		info!("{}: replicating chunk {} again, perceived degree {} of {}", self.node(), key, perceived, chunk.desired_degree);
		let peer = self.clone();
		tokio::spawn(async move { peer.reclaim_chunk_backup(chunk, data, stored, true).await });
		Ok(())
	}

	async fn on_filecheck(&self, message: &Message) -> BackupResult<()> {
		let file_id = message.file_id()?;
		if !self.state.is_deleted(file_id) {
			return Ok(());
		}

		let tracker = self.trackers.delete.track();
		sleep(random_delay(ANSWER_JITTER, 0)).await;
		let answered = tracker.contains(file_id);
		self.trackers.delete.dispose(&tracker);
		if !answered {
			self.broadcast(ChannelKind::Control, &self.factory.delete(file_id)).await;
		}
		Ok(())
	}
}

async fn fetch_chunk(addr: SocketAddr) -> io::Result<Vec<u8>> {
	let fetch = async {
		let mut stream = TcpStream::connect(addr).await?;
		let mut data = Vec::new();
		stream.read_to_end(&mut data).await?;
		Ok::<_, io::Error>(data)
	};
	timeout(CHUNK_SOCKET_TIMEOUT, fetch).await
		.map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("fetching chunk from {} timed out", addr)))?
}
