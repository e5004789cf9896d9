use std::{
	io,
	net::Ipv4Addr,
	sync::Arc,
	time::Duration
};
use log::debug;
use tokio::{
	io::AsyncWriteExt,
	net::TcpListener,
	time::{sleep, timeout}
};
use super::{
	random_delay,
	peer::Peer,
	channel::ChannelKind,
	tracker::Tracker,
	file_store::ChunkStore,
	message::{Message, ProtocolVersion},
	error::BackupResult
};

// anti-collision delays in ms
const STORED_JITTER: u64 = 400;
const ENHANCED_BACKUP_JITTER: u64 = 2000;
const ENHANCED_BACKUP_OFFSET: u64 = 400;
/// How long a chunk waits for its requester to connect
pub const CHUNK_SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// How a peer reacts to PUTCHUNK, chosen once from the protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStrategy {
	/// store right away
	Vanilla,
	/// wait first and skip chunks that already reached their degree
	Enhanced
}

impl BackupStrategy {
	pub fn for_version(version: ProtocolVersion) -> Self {
		if version.is_vanilla() { BackupStrategy::Vanilla } else { BackupStrategy::Enhanced }
	}

	/// Store the chunk offered by a PUTCHUNK and announce it.
	/// Takes over the tracker created when the PUTCHUNK arrived.
	pub async fn store(&self, peer: &Peer, message: &Message, tracker: Arc<Tracker>) -> BackupResult<()> {
		let file_id = message.file_id()?;
		let chunk_no = message.chunk_no()?;
		let key = message.chunk_key()?;

		if *self == BackupStrategy::Enhanced {
			sleep(random_delay(ENHANCED_BACKUP_JITTER, ENHANCED_BACKUP_OFFSET)).await;
			let enough = tracker.count(&key) >= message.replication_degree()? as usize;
			if enough || peer.state.is_deleted(file_id) {
				debug!("{}: not storing {}, {} peers have it", peer.node(), key, tracker.count(&key));
				peer.trackers.stored.dispose(&tracker);
				return Ok(());
			}
		}

		// quota is checked again when committing
		match peer.commit_putchunk(message, &tracker) {
			Ok(true) => (),
			result => {
				peer.trackers.stored.dispose(&tracker);
				return result.map(|_| ());
			}
		}
		peer.broadcast(ChannelKind::Control, &peer.factory.stored(file_id, chunk_no)).await;
		peer.dispose_stored_later(tracker);
		Ok(())
	}

	/// Announce again a chunk this peer already stores
	pub async fn announce_stored(&self, peer: &Peer, file_id: &str, chunk_no: u32) {
		sleep(random_delay(STORED_JITTER, 0)).await;
		peer.broadcast(ChannelKind::Control, &peer.factory.stored(file_id, chunk_no)).await;
	}
}

/// How a peer answers GETCHUNK, chosen once from the protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStrategy {
	/// chunk data on the restore channel
	Vanilla,
	/// only a TCP port on the restore channel, the data goes point to point
	Enhanced
}

impl RestoreStrategy {
	pub fn for_version(version: ProtocolVersion) -> Self {
		if version.is_vanilla() { RestoreStrategy::Vanilla } else { RestoreStrategy::Enhanced }
	}

	pub async fn send_chunk(&self, peer: &Peer, request: &Message) -> BackupResult<()> {
		let file_id = request.file_id()?;
		let chunk_no = request.chunk_no()?;
		let data = peer.store.read_chunk(file_id, chunk_no)?;

		match self {
			// a vanilla requester cannot fetch by socket
			RestoreStrategy::Enhanced if !request.version.is_vanilla() => {
				let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
				let port = listener.local_addr()?.port();
				let message = peer.factory.chunk(file_id, chunk_no, port.to_string().into_bytes());
				peer.broadcast(ChannelKind::Restore, &message).await;

				let (mut stream, addr) = timeout(CHUNK_SOCKET_TIMEOUT, listener.accept()).await
					.map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "nobody fetched the chunk"))??;
				stream.write_all(&data).await?;
				stream.shutdown().await?;
				debug!("{}: sent chunk {}:{} to {}", peer.node(), file_id, chunk_no, addr);
			},
			_ => {
				let message = peer.factory.with_version(ProtocolVersion::VANILLA)
					.chunk(file_id, chunk_no, data);
				peer.broadcast(ChannelKind::Restore, &message).await;
			}
		}
		Ok(())
	}
}
