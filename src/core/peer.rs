use std::{
	future::Future,
	path::Path,
	sync::Arc,
	time::Duration
};
use futures::{future, prelude::*};
use log::{debug, error, info, warn};
use tarpc::{
	context,
	server::Channel,
	tokio_serde::formats::Bincode
};
use tokio::{sync::watch, task::JoinHandle};
use super::{
	ring::*,
	config::Config,
	chord::Chord,
	state::PeerState,
	file_store::DiskStore,
	tracker::{Tracker, Trackers},
	bucket::DataBucket,
	channel::{ChannelKind, Channels},
	message::{Message, MessageFactory},
	strategy::{BackupStrategy, RestoreStrategy},
	protocol::OpResult,
	error::{BackupError::*, BackupResult}
};
use crate::{client::Connections, rpc::*, server::ServerManager};

/// A backup peer: ring node, chunk store and client of its own files
#[derive(Clone)]
pub struct Peer {
	pub(crate) config: Arc<Config>,
	pub(crate) chord: Chord,
	pub(crate) state: PeerState,
	pub(crate) store: DiskStore,
	pub(crate) trackers: Arc<Trackers>,
	pub(crate) buckets: DataBucket,
	pub(crate) channels: Channels,
	pub(crate) connections: Connections,
	pub(crate) factory: MessageFactory,
	pub(crate) backup_strategy: BackupStrategy,
	pub(crate) restore_strategy: RestoreStrategy
}

impl Peer {
	/// Create a peer, loading its state from the root directory
	pub fn new(node: ChordNode, config: Config, channels: Channels) -> BackupResult<Self> {
		let state = PeerState::load(&config.root_dir)?;
		let store = DiskStore::new(&config.root_dir);
		let factory = MessageFactory::new(config.version, node.id);
		let connections = Connections::new();
		let chord = Chord::new(node, factory.clone(), connections.clone());

		Ok(Peer {
			backup_strategy: BackupStrategy::for_version(config.version),
			restore_strategy: RestoreStrategy::for_version(config.version),
			config: Arc::new(config),
			chord,
			state,
			store,
			trackers: Arc::new(Trackers::new()),
			buckets: DataBucket::new(),
			channels,
			connections,
			factory
		})
	}

	pub fn id(&self) -> Digest {
		self.chord.node().id
	}

	pub fn node(&self) -> &ChordNode {
		self.chord.node()
	}

	pub fn chord(&self) -> &Chord {
		&self.chord
	}

	pub fn state(&self) -> &PeerState {
		&self.state
	}

	pub fn store(&self) -> &DiskStore {
		&self.store
	}

	pub fn trackers(&self) -> &Trackers {
		&self.trackers
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Start the server
	/// Returns once the listeners are up and the ring is joined
	pub async fn start(&self, join_node: Option<ChordNode>) -> BackupResult<ServerManager> {
		// channel used to shutdown (true means shutdown)
		let (tx, rx) = watch::channel(false);

		// Listen locally first
		let mut listener = tarpc::serde_transport::tcp::listen(&self.node().addr, Bincode::default).await?;
		let server = self.clone();
		let mut listener_rx = rx.clone();
		// Listen for rpc call
		let listener_handle = tokio::spawn(async move {
			listener.config_mut().max_frame_length(usize::MAX);
			let listener_fut = listener
				.filter_map(|r| future::ready(r.ok()))
				.map(tarpc::server::BaseChannel::with_defaults)
				.map(|channel| async {
					// Clone a new server to share the data in Arc
					channel.execute(server.clone().serve()).await;
				})
				.buffer_unordered(server.config.max_connections as usize)
				.for_each(|_| async {});

			debug!("{}: listening", server.node());

			tokio::select! {
				_ = listener_fut => {
					warn!("{}: listener terminated", server.node());
				},
				_ = listener_rx.changed() => {
					debug!("{}: listener stopped gracefully", server.node());
				}
			};
		});

		// Join node after server starts
		if let Some(n) = join_node.as_ref() {
			if let Err(e) = self.chord.join(n).await {
				let _ = tx.send(true);
				return Err(e);
			}
		}

		let mut handles = vec![listener_handle];
		// subscribe now so nothing broadcast after start is missed
		for kind in [ChannelKind::Control, ChannelKind::Backup, ChannelKind::Restore] {
			handles.push(self.spawn_listener(kind, rx.clone()));
		}

		let chord = self.chord.clone();
		handles.push(self.spawn_periodic("stabilize", self.config.stabilize_interval, rx.clone(), move || {
			let chord = chord.clone();
			async move { chord.stabilize().await }
		}));
		let chord = self.chord.clone();
		handles.push(self.spawn_periodic("fix_finger", self.config.fix_finger_interval, rx.clone(), move || {
			let chord = chord.clone();
			async move { chord.update_fingers().await }
		}));
		let chord = self.chord.clone();
		handles.push(self.spawn_periodic("check_predecessor", self.config.check_predecessor_interval, rx.clone(), move || {
			let chord = chord.clone();
			async move { chord.check_predecessor().await }
		}));
		let chord = self.chord.clone();
		handles.push(self.spawn_periodic("successor_list", self.config.successor_list_interval, rx.clone(), move || {
			let chord = chord.clone();
			async move { chord.update_successor_list().await }
		}));

		if self.config.check_deleted_on_start {
			let peer = self.clone();
			handles.push(tokio::spawn(async move { peer.check_deleted().await }));
		}

		info!("{}: listening at {}", self.node(), self.node().addr);
		Ok(ServerManager {
			// An aggregated handle for all tasks
			handle: future::join_all(handles),
			tx
		})
	}

	fn spawn_periodic<F, Fut>(&self, name: &'static str, period: u64, mut rx: watch::Receiver<bool>, task: F) -> JoinHandle<()>
	where
		F: Fn() -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send
	{
		let node = self.node().clone();
		tokio::spawn(async move {
			if period == 0 {
				return;
			}
			let mut interval = tokio::time::interval(Duration::from_millis(period));
			loop {
				tokio::select! {
					_ = interval.tick() => task().await,
					_ = rx.changed() => {
						debug!("{}: {} task stopped gracefully", node, name);
						break;
					}
				}
			}
		})
	}

	fn spawn_listener(&self, kind: ChannelKind, mut rx: watch::Receiver<bool>) -> JoinHandle<()> {
		let peer = self.clone();
		let messages = self.channels.get(kind).subscribe();
		tokio::spawn(async move {
			let listener_fut = messages.for_each_concurrent(peer.config.max_workers, |(data, sender)| {
				peer.handle_broadcast(kind, data, sender)
			});
			tokio::select! {
				_ = listener_fut => {
					warn!("{}: {} channel closed", peer.node(), kind);
				},
				_ = rx.changed() => {
					debug!("{}: {} listener stopped gracefully", peer.node(), kind);
				}
			};
		})
	}

	/// Send a ring message and wait for its reply.
	/// Messages to this peer are handled in place.
	pub async fn request(&self, node: &ChordNode, message: Message) -> BackupResult<Message> {
		if node.id == self.id() {
			return self.handle_request(message).await
				.ok_or_else(|| NoReply(node.clone()));
		}
		self.connections.request(node, &message).await
	}

	pub async fn broadcast(&self, kind: ChannelKind, message: &Message) {
		debug!("{}: sending {} on {} channel", self.node(), message, kind);
		if let Err(e) = self.channels.get(kind).send(message.encode()).await {
			error!("{}: failed to send on {} channel: {}", self.node(), kind, e);
		}
	}

	/// Ask whether files stored here were deleted while this peer was away
	pub async fn check_deleted(&self) {
		for file_id in self.state.stored_file_ids() {
			self.broadcast(ChannelKind::Control, &self.factory.filecheck(&file_id)).await;
		}
	}

	/// Keep counting STORED acknowledgements for a while, then stop
	pub(crate) fn dispose_stored_later(&self, tracker: Arc<Tracker>) {
		let peer = self.clone();
		let lifetime = Duration::from_millis(self.config.tracker_lifetime);
		tokio::spawn(async move {
			tokio::time::sleep(lifetime).await;
			peer.trackers.stored.dispose(&tracker);
		});
	}

	pub fn status(&self) -> String {
		format!("{}\n{}", self.chord, self.state)
	}
}

#[tarpc::server]
impl PeerService for Peer {
	async fn deliver_rpc(self, _: context::Context, frame: Vec<u8>) -> Option<Vec<u8>> {
		match Message::decode(&frame) {
			Ok(message) => self.handle_request(message).await.map(|reply| reply.encode()),
			Err(e) => {
				warn!("{}: dropping malformed request: {}", self.node(), e);
				None
			}
		}
	}

	async fn ping_rpc(self, _: context::Context) -> Digest {
		self.id()
	}

	async fn backup_rpc(self, _: context::Context, path: String, replication_degree: u32) -> OpResult {
		self.backup(Path::new(&path), replication_degree).await
	}

	async fn restore_rpc(self, _: context::Context, file_name: String) -> OpResult {
		self.restore(&file_name).await
	}

	async fn delete_rpc(self, _: context::Context, file_name: String) -> OpResult {
		self.delete(&file_name).await
	}

	async fn reclaim_rpc(self, _: context::Context, max_storage: i64) -> OpResult {
		self.reclaim(max_storage).await
	}

	async fn status_rpc(self, _: context::Context) -> String {
		self.status()
	}
}
