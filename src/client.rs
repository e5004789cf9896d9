use std::{
	collections::HashMap,
	io,
	sync::{Arc, RwLock}
};
use log::debug;
use tarpc::{context, tokio_serde::formats::Bincode};
use crate::{
	core::{
		ring::ChordNode,
		message::Message,
		error::{BackupError, BackupResult}
	},
	rpc::PeerServiceClient
};

pub async fn setup_client(addr: &str) -> io::Result<PeerServiceClient> {
	let transport = tarpc::serde_transport::tcp::connect(addr, Bincode::default).await?;
	Ok(PeerServiceClient::new(tarpc::client::Config::default(), transport).spawn())
}

/// Clients of remote peers, by address
#[derive(Clone, Default)]
pub struct Connections {
	clients: Arc<RwLock<HashMap<String, PeerServiceClient>>>
}

impl Connections {
	pub fn new() -> Self {
		Self::default()
	}

	async fn get(&self, node: &ChordNode) -> BackupResult<PeerServiceClient> {
		// Use block to drop map immediately after use
		{
			let map = self.clients.read().unwrap();
			if let Some(c) = map.get(&node.addr) {
				// client can be cloned with low cost
				return Ok(c.clone());
			}
		}
		debug!("connecting to {}", node);
		let c = setup_client(&node.addr).await?;
		self.clients.write().unwrap().insert(node.addr.clone(), c.clone());
		Ok(c)
	}

	pub fn evict(&self, node: &ChordNode) {
		self.clients.write().unwrap().remove(&node.addr);
	}

	async fn deliver(&self, node: &ChordNode, message: &Message) -> BackupResult<Option<Vec<u8>>> {
		let client = self.get(node).await?;
		match client.deliver_rpc(context::current(), message.encode()).await {
			Ok(reply) => Ok(reply),
			Err(e) => {
				// reconnect next time
				self.evict(node);
				Err(e.into())
			}
		}
	}

	/// Send a message and wait for its reply
	pub async fn request(&self, node: &ChordNode, message: &Message) -> BackupResult<Message> {
		match self.deliver(node, message).await? {
			Some(reply) => Ok(Message::decode(&reply)?),
			None => Err(BackupError::NoReply(node.clone()))
		}
	}

	/// Send a message that expects no reply
	pub async fn send(&self, node: &ChordNode, message: &Message) -> BackupResult<()> {
		self.deliver(node, message).await?;
		Ok(())
	}

	pub async fn ping(&self, node: &ChordNode) -> bool {
		let client = match self.get(node).await {
			Ok(c) => c,
			Err(_) => return false
		};
		match client.ping_rpc(context::current()).await {
			Ok(id) => id == node.id,
			Err(_) => {
				self.evict(node);
				false
			}
		}
	}
}
