use std::{
	collections::HashSet,
	fmt,
	sync::{Arc, RwLock}
};
use log::{debug, error, warn};
use super::{
	ring::*,
	message::{Message, MessageFactory, MessageType},
	error::{BackupError::*, BackupResult}
};
use crate::client::Connections;

// successors kept besides the direct one
const SUCCESSOR_LIST_LEN: usize = 4;

/// Answer of one node to a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
	/// the node responsible for the key
	Found(ChordNode),
	/// ask this node next
	Next(ChordNode)
}

/// Ring position and routing state of this peer
#[derive(Clone)]
pub struct Chord {
	node: ChordNode,
	factory: MessageFactory,
	connections: Connections,
	predecessor: Arc<RwLock<Option<ChordNode>>>,
	successor: Arc<RwLock<ChordNode>>,
	// successors of the successor, used when it goes down
	successor_list: Arc<RwLock<Vec<ChordNode>>>,
	finger_table: Arc<RwLock<Vec<Option<ChordNode>>>>,
	next_finger: Arc<RwLock<usize>>
}

impl Chord {
	/// A ring with only this node
	pub fn new(node: ChordNode, factory: MessageFactory, connections: Connections) -> Self {
		Chord {
			successor: Arc::new(RwLock::new(node.clone())),
			node,
			factory,
			connections,
			predecessor: Arc::new(RwLock::new(None)),
			successor_list: Arc::new(RwLock::new(Vec::new())),
			finger_table: Arc::new(RwLock::new(vec![None; NUM_BITS])),
			next_finger: Arc::new(RwLock::new(0))
		}
	}

	pub fn node(&self) -> &ChordNode {
		&self.node
	}

	pub fn get_successor(&self) -> ChordNode {
		self.successor.read().unwrap().clone()
	}

	pub fn set_successor(&self, node: ChordNode) {
		*self.successor.write().unwrap() = node;
	}

	pub fn get_predecessor(&self) -> Option<ChordNode> {
		self.predecessor.read().unwrap().clone()
	}

	pub fn set_predecessor(&self, node: Option<ChordNode>) {
		*self.predecessor.write().unwrap() = node;
	}

	pub fn get_successor_list(&self) -> Vec<ChordNode> {
		self.successor_list.read().unwrap().clone()
	}

	pub fn get_finger(&self, index: usize) -> Option<ChordNode> {
		self.finger_table.read().unwrap()[index].clone()
	}

	/// Whether this node is its own successor
	pub fn is_alone(&self) -> bool {
		self.get_successor().id == self.node.id
	}

	// Calculate start field of finger table
	// k in [0, m)
	pub fn finger_table_start(&self, k: usize) -> Digest {
		self.node.id.wrapping_add(1 << k)
	}

	/// Find the node responsible for a key starting from the bootstrap node
	pub async fn join(&self, bootstrap: &ChordNode) -> BackupResult<()> {
		debug!("{}: joining {}", self.node, bootstrap);
		self.set_predecessor(None);
		let succ = self.lookup_from(bootstrap.clone(), self.node.id).await
			.map_err(|e| JoinFailure {
				node: bootstrap.clone(),
				message: e.to_string()
			})?;
		self.set_successor(succ);
		debug!("{}: joined {}, successor {}", self.node, bootstrap, self.get_successor());
		Ok(())
	}

	/// Highest finger strictly between this node and the key, or this node
	pub fn closest_preceding_node(&self, key: Digest) -> ChordNode {
		let table = self.finger_table.read().unwrap();
		for finger in table.iter().rev().flatten() {
			if in_range(finger.id, self.node.id, key) {
				return finger.clone();
			}
		}
		self.node.clone()
	}

	/// One routing step answered locally
	pub fn route(&self, key: Digest) -> Route {
		let succ = self.get_successor();
		let no_fingers = self.finger_table.read().unwrap().iter().all(Option::is_none);
		if no_fingers || in_range_incl(key, self.node.id, succ.id) {
			return Route::Found(succ);
		}
		let next = self.closest_preceding_node(key);
		if next.id == self.node.id {
			// no finger is closer, so stop here
			Route::Found(self.node.clone())
		}
		else {
			Route::Next(next)
		}
	}

	async fn query(&self, node: &ChordNode, key: Digest) -> BackupResult<Route> {
		if node.id == self.node.id {
			return Ok(self.route(key));
		}
		let reply = self.connections.request(node, &self.factory.lookup(key)).await?;
		match reply.kind {
			MessageType::Node => Ok(Route::Found(reply.node()?.clone())),
			MessageType::Redirect => Ok(Route::Next(reply.node()?.clone())),
			kind => Err(UnexpectedReply(kind))
		}
	}

	/// Find the node responsible for a key
	pub async fn lookup(&self, key: Digest) -> BackupResult<ChordNode> {
		self.lookup_from(self.node.clone(), key).await
	}

	// Iterative lookup, each node is asked at most once
	async fn lookup_from(&self, start: ChordNode, key: Digest) -> BackupResult<ChordNode> {
		let mut visited = HashSet::new();
		let mut current = start;
		loop {
			if !visited.insert(current.id) {
				return Err(LookupLoop(key));
			}
			match self.query(&current, key).await {
				Ok(Route::Found(n)) => return Ok(n),
				Ok(Route::Next(n)) => current = n,
				Err(e) => {
					self.peer_is_down(&current);
					return Err(e);
				}
			}
		}
	}

	async fn ask(&self, node: &ChordNode, message: Message) -> BackupResult<Option<ChordNode>> {
		let reply = self.connections.request(node, &message).await?;
		match reply.kind {
			MessageType::Node => Ok(reply.maybe_node().cloned()),
			kind => Err(UnexpectedReply(kind))
		}
	}

	pub async fn predecessor_of(&self, node: &ChordNode) -> BackupResult<Option<ChordNode>> {
		if node.id == self.node.id {
			return Ok(self.get_predecessor());
		}
		self.ask(node, self.factory.get_predecessor()).await
	}

	pub async fn successor_of(&self, node: &ChordNode) -> BackupResult<ChordNode> {
		if node.id == self.node.id {
			return Ok(self.get_successor());
		}
		self.ask(node, self.factory.get_successor()).await?
			.ok_or_else(|| NoReply(node.clone()))
	}

	// Figure 7: n.stabilize
	pub async fn stabilize(&self) {
		let succ = self.get_successor();
		let x = match self.predecessor_of(&succ).await {
			Ok(x) => x,
			Err(e) => {
				error!("{}: fail to stabilize: {}", self.node, e);
				self.peer_is_down(&succ);
				return;
			}
		};
		if let Some(x) = x {
			if in_range(x.id, self.node.id, succ.id) {
				self.set_successor(x);
			}
		}

		let succ = self.get_successor();
		if succ.id == self.node.id {
			return;
		}
		if let Err(e) = self.connections.send(&succ, &self.factory.notify(self.node.clone())).await {
			// can only be fixed by stabilizing again
			warn!("{}: fail to notify {}: {}", self.node, succ, e);
		}
	}

	// Figure 7: n.notify
	pub fn notify(&self, candidate: ChordNode) {
		if candidate.id == self.node.id {
			return;
		}
		let adopt = match self.get_predecessor() {
			Some(pred) => in_range(candidate.id, pred.id, self.node.id),
			None => true
		};
		if adopt {
			debug!("{}: new predecessor {}", self.node, candidate);
			self.set_predecessor(Some(candidate.clone()));
		}
		// a ring of two
		if self.is_alone() {
			self.set_successor(candidate);
		}
	}

	// Figure 7: n.fix_fingers
	pub async fn fix_finger(&self, index: usize) -> BackupResult<()> {
		let succ = self.lookup(self.finger_table_start(index)).await?;
		self.finger_table.write().unwrap()[index] = Some(succ);
		Ok(())
	}

	/// Refresh the next finger, one per call
	pub async fn update_fingers(&self) {
		let index = *self.next_finger.read().unwrap();
		match self.fix_finger(index).await {
			Ok(_) => *self.next_finger.write().unwrap() = (index + 1) % NUM_BITS,
			Err(e) => error!("{}: failed to fix finger {}: {}", self.node, index, e)
		}
	}

	/// Clear the predecessor if it stopped answering
	pub async fn check_predecessor(&self) {
		if let Some(pred) = self.get_predecessor() {
			if !self.connections.ping(&pred).await {
				warn!("{}: predecessor {} is down", self.node, pred);
				self.peer_is_down(&pred);
			}
		}
	}

	/// Refresh the list of successors following the direct one
	pub async fn update_successor_list(&self) {
		let mut list = Vec::with_capacity(SUCCESSOR_LIST_LEN);
		let mut current = self.get_successor();
		while list.len() < SUCCESSOR_LIST_LEN {
			let next = match self.successor_of(&current).await {
				Ok(n) => n,
				Err(e) => {
					warn!("{}: fail to get successor of {}: {}", self.node, current, e);
					return;
				}
			};
			if next.id == self.node.id || list.contains(&next) {
				break;
			}
			list.push(next.clone());
			current = next;
		}
		*self.successor_list.write().unwrap() = list;
	}

	/// Forget a node that stopped answering
	pub fn peer_is_down(&self, node: &ChordNode) {
		if node.id == self.node.id {
			return;
		}
		self.connections.evict(node);
		{
			let mut table = self.finger_table.write().unwrap();
			for finger in table.iter_mut() {
				if finger.as_ref().map_or(false, |f| f.id == node.id) {
					*finger = None;
				}
			}
		}
		{
			let mut list = self.successor_list.write().unwrap();
			list.retain(|n| n.id != node.id);
			let mut succ = self.successor.write().unwrap();
			if succ.id == node.id {
				*succ = match list.first() {
					Some(n) => n.clone(),
					None => self.node.clone()
				};
				warn!("{}: successor {} is down, moving to {}", self.node, node, succ);
			}
		}
		let mut pred = self.predecessor.write().unwrap();
		if pred.as_ref().map_or(false, |p| p.id == node.id) {
			*pred = None;
		}
	}
}

impl fmt::Display for Chord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "{}", self.node)?;
		match self.get_predecessor() {
			Some(p) => writeln!(f, "Predecessor: {}", p)?,
			None => writeln!(f, "Predecessor: none")?
		};
		writeln!(f, "Successor: {}", self.get_successor())?;
		for n in self.get_successor_list() {
			writeln!(f, "  then {}", n)?;
		}
		let table = self.finger_table.read().unwrap();
		for (i, finger) in table.iter().enumerate() {
			if let Some(finger) = finger {
				writeln!(f, "Finger {} ({}): {}", i, self.finger_table_start(i), finger)?;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::message::ProtocolVersion;

	fn node(id: Digest) -> ChordNode {
		ChordNode {
			id,
			addr: format!("127.0.0.1:{}", id)
		}
	}

	fn chord(id: Digest) -> Chord {
		Chord::new(node(id), MessageFactory::new(ProtocolVersion::VANILLA, id), Connections::new())
	}

	#[test]
	fn test_single_node() {
		let c = chord(100);
		assert!(c.is_alone());
		assert_eq!(c.route(5), Route::Found(node(100)));
		assert_eq!(c.route(100), Route::Found(node(100)));
	}

	#[test]
	fn test_notify() {
		let c = chord(100);
		c.notify(node(50));
		assert_eq!(c.get_predecessor(), Some(node(50)));
		// bootstraps a ring of two
		assert_eq!(c.get_successor(), node(50));

		c.notify(node(70));
		assert_eq!(c.get_predecessor(), Some(node(70)));
		c.notify(node(60));
		assert_eq!(c.get_predecessor(), Some(node(70)));
		assert_eq!(c.get_successor(), node(50));
	}

	#[test]
	fn test_route() {
		let c = chord(100);
		c.set_successor(node(200));
		assert_eq!(c.route(150), Route::Found(node(200)));
		assert_eq!(c.route(200), Route::Found(node(200)));
		// no fingers yet
		assert_eq!(c.route(300), Route::Found(node(200)));

		c.finger_table.write().unwrap()[7] = Some(node(250));
		assert_eq!(c.closest_preceding_node(300), node(250));
		assert_eq!(c.route(300), Route::Next(node(250)));
		assert_eq!(c.closest_preceding_node(240), node(100));
		// no finger is closer
		assert_eq!(c.route(240), Route::Found(node(100)));
	}

	#[test]
	fn test_peer_is_down() {
		let c = chord(100);
		c.set_successor(node(200));
		c.set_predecessor(Some(node(50)));
		*c.successor_list.write().unwrap() = vec![node(300), node(50)];
		c.finger_table.write().unwrap()[3] = Some(node(200));

		c.peer_is_down(&node(200));
		assert_eq!(c.get_successor(), node(300));
		assert_eq!(c.get_finger(3), None);

		c.peer_is_down(&node(50));
		assert_eq!(c.get_predecessor(), None);
		c.peer_is_down(&node(300));
		assert!(c.is_alone());
	}
}
