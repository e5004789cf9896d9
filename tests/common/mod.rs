#![allow(dead_code)]

use std::{
	net::{IpAddr, Ipv4Addr},
	path::Path,
	time::Duration
};
use chord_backup::{
	core::{
		ring::{ChordNode, Digest, NUM_BITS},
		channel::LocalNetwork,
		message::ProtocolVersion,
		Config,
		Peer
	},
	server::ServerManager
};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

pub fn init_logger() {
	let _ = env_logger::builder().is_test(true).try_init();
}

pub fn local_node(port: u16, id: Digest) -> ChordNode {
	ChordNode {
		id,
		addr: format!("127.0.0.1:{}", port)
	}
}

// Ring maintenance is driven by the tests
pub fn test_config(dir: &Path, version: ProtocolVersion) -> Config {
	Config {
		version,
		root_dir: dir.to_path_buf(),
		stabilize_interval: 0,
		fix_finger_interval: 0,
		check_predecessor_interval: 0,
		successor_list_interval: 0,
		putchunk_base_delay: Some(200),
		getchunk_base_delay: 200,
		bucket_idle_timeout: 2000,
		tracker_lifetime: 3000,
		delete_grace: 5000,
		check_deleted_on_start: false,
		..Config::default()
	}
}

pub async fn spawn_peer(
	network: &LocalNetwork,
	node: ChordNode,
	config: Config,
	join: Option<&Peer>
) -> anyhow::Result<(Peer, ServerManager)> {
	let peer = Peer::new(node, config, network.join(LOCALHOST))?;
	let manager = peer.start(join.map(|p| p.node().clone())).await?;
	Ok((peer, manager))
}

pub async fn stabilize_ring(peers: &[Peer]) {
	for _ in 0..=peers.len() {
		for p in peers {
			p.chord().stabilize().await;
		}
	}
	// the first pass fixes every immediate successor finger,
	// the second routes on them
	for _ in 0..2 {
		for p in peers {
			for i in 0..NUM_BITS {
				p.chord().fix_finger(i).await.unwrap();
			}
		}
	}
	for p in peers {
		p.chord().update_successor_list().await;
	}
}

/// Poll a condition until it holds or the time runs out
pub async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
	let step = Duration::from_millis(50);
	let mut waited = Duration::ZERO;
	while waited < limit {
		if condition() {
			return true;
		}
		tokio::time::sleep(step).await;
		waited += step;
	}
	condition()
}

// Expected owner of a key: first id at or after it on the ring
pub fn expected_owner(ids: &[Digest], key: Digest) -> Digest {
	let mut sorted = ids.to_vec();
	sorted.sort();
	*sorted.iter().find(|&&id| id >= key).unwrap_or(&sorted[0])
}
