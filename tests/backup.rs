use std::{collections::BTreeSet, fs, net::IpAddr, time::Duration};
use chord_backup::core::{
	calculate_hash,
	generate_file_id,
	channel::{LocalNetwork, ChannelKind},
	message::{Message, MessageFactory, MessageType, ProtocolVersion},
	ring::Digest,
	file_store::ChunkStore,
	Peer
};
use futures::{stream::BoxStream, StreamExt};
use tempfile::tempdir;
use tokio::{
	io::AsyncReadExt,
	net::TcpStream,
	task::yield_now,
	time::{sleep, timeout}
};

// Common mod in tests
mod common;
use common::*;

const FOREIGN_ID: Digest = 77;

fn test_data(len: usize) -> Vec<u8> {
	(0..len).map(|i| (i % 251) as u8).collect()
}

// Decoded messages seen on a channel within the time limit
async fn drain(stream: &mut BoxStream<'static, (Vec<u8>, IpAddr)>, limit: Duration) -> Vec<Message> {
	let mut messages = Vec::new();
	let _ = timeout(limit, async {
		while let Some((data, _)) = stream.next().await {
			if let Ok(m) = Message::decode(&data) {
				messages.push(m);
			}
		}
	}).await;
	messages
}

// Let the listeners of the current thread runtime catch up
async fn settle() {
	for _ in 0..20 {
		yield_now().await;
	}
}

fn holders<'a>(peers: &'a [Peer], file_id: &str) -> Vec<&'a Peer> {
	peers.iter().filter(|p| p.state().has_file_chunks(file_id)).collect()
}

#[tokio::test]
async fn test_single_peer_backup_and_restore() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let (dir, files) = (tempdir()?, tempdir()?);
	let (p0, _m0) = spawn_peer(&network, local_node(9850, 1), test_config(dir.path(), ProtocolVersion::VANILLA), None).await?;

	let path = files.path().join("report.bin");
	let data = test_data(150_000);
	fs::write(&path, &data)?;

	let result = p0.backup(&path, 1).await;
	assert!(result.success, "{}", result);
	let info = p0.state().file_by_name("report.bin").unwrap();
	assert_eq!(info.chunks.len(), 3);
	assert_eq!(info.byte_amount, 150_000);
	// a lone peer keeps its own copy
	assert_eq!(p0.state().file_chunks(&info.file_id).len(), 3);

	let result = p0.restore("report.bin").await;
	assert!(result.success, "{}", result);
	assert_eq!(fs::read(p0.store().restored_path("report.bin"))?, data);

	assert!(!p0.restore("missing.bin").await.success);
	assert!(!p0.backup(&path, 0).await.success);
	Ok(())
}

#[tokio::test]
async fn test_backup_again_replaces_previous_version() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let (dir, files) = (tempdir()?, tempdir()?);
	let (p0, _m0) = spawn_peer(&network, local_node(9851, 1), test_config(dir.path(), ProtocolVersion::VANILLA), None).await?;

	let path = files.path().join("notes.txt");
	fs::write(&path, b"first version")?;
	assert!(p0.backup(&path, 1).await.success);
	let old = p0.state().file_by_name("notes.txt").unwrap();

	let data = b"second version, somewhat longer".to_vec();
	fs::write(&path, &data)?;
	assert!(p0.backup(&path, 1).await.success);
	let new = p0.state().file_by_name("notes.txt").unwrap();

	assert_ne!(old.file_id, new.file_id);
	assert!(p0.state().is_deleted(&old.file_id));
	assert!(!p0.state().owns_file(&old.file_id));
	assert!(!p0.store().chunk_dir(&old.file_id).exists());
	assert!(!p0.state().is_deleted(&new.file_id));

	assert!(p0.restore("notes.txt").await.success);
	assert_eq!(fs::read(p0.store().restored_path("notes.txt"))?, data);
	Ok(())
}

#[tokio::test]
async fn test_ring_backup_restore_and_delete() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let (files, dirs) = (tempdir()?, [tempdir()?, tempdir()?, tempdir()?]);
	let config = |i: usize| test_config(dirs[i].path(), ProtocolVersion::VANILLA);
	let (p0, _m0) = spawn_peer(&network, local_node(9860, 0), config(0), None).await?;
	let (p1, _m1) = spawn_peer(&network, local_node(9861, Digest::MAX / 3), config(1), Some(&p0)).await?;
	let (p2, _m2) = spawn_peer(&network, local_node(9862, Digest::MAX / 3 * 2), config(2), Some(&p0)).await?;
	let peers = [p0.clone(), p1.clone(), p2.clone()];
	stabilize_ring(&peers).await;

	let path = files.path().join("photo.raw");
	let data = test_data(100_000);
	fs::write(&path, &data)?;

	let result = p0.backup(&path, 2).await;
	assert!(result.success, "{}", result);
	let info = p0.state().file_by_name("photo.raw").unwrap();
	assert_eq!(info.chunks.len(), 2);
	assert!(info.chunks.values().all(|&d| d == 2));

	// the owner never holds its own file on a ring
	assert!(!p0.state().has_file_chunks(&info.file_id));
	for p in [&p1, &p2] {
		assert_eq!(p.state().file_chunks(&info.file_id).len(), 2);
		assert_eq!(p.store().read_chunk(&info.file_id, 1)?, data[64000..].to_vec());
	}

	let result = p0.restore("photo.raw").await;
	assert!(result.success, "{}", result);
	assert_eq!(fs::read(p0.store().restored_path("photo.raw"))?, data);

	assert!(p0.delete("photo.raw").await.success);
	assert!(wait_until(|| holders(&peers, &info.file_id).is_empty(), Duration::from_secs(3)).await);
	assert!(p1.state().is_deleted(&info.file_id));
	assert!(p2.state().is_deleted(&info.file_id));
	assert!(!p1.store().chunk_dir(&info.file_id).exists());
	assert!(p0.state().file_by_name("photo.raw").is_none());
	Ok(())
}

#[tokio::test]
async fn test_reclaim_moves_chunks_elsewhere() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let (files, dirs) = (tempdir()?, [tempdir()?, tempdir()?, tempdir()?]);
	let config = |i: usize| test_config(dirs[i].path(), ProtocolVersion::VANILLA);
	let (p0, _m0) = spawn_peer(&network, local_node(9870, 0), config(0), None).await?;
	let (p1, _m1) = spawn_peer(&network, local_node(9871, Digest::MAX / 3), config(1), Some(&p0)).await?;
	let (p2, _m2) = spawn_peer(&network, local_node(9872, Digest::MAX / 3 * 2), config(2), Some(&p0)).await?;
	let peers = [p0.clone(), p1.clone(), p2.clone()];
	stabilize_ring(&peers).await;

	let path = files.path().join("archive.tar");
	fs::write(&path, test_data(90_000))?;
	assert!(p0.backup(&path, 1).await.success);
	let info = p0.state().file_by_name("archive.tar").unwrap();

	let found = holders(&peers, &info.file_id);
	assert_eq!(found.len(), 1);
	let holder = found[0].clone();
	let other = if holder.id() == p1.id() { p2.clone() } else { p1.clone() };
	let before = holder.state().occupied_storage();
	assert_eq!(before, 90_000);

	let mut putchunks = network.join(LOCALHOST).backup.subscribe();
	let result = holder.reclaim(70_000).await;
	assert!(result.success, "{}", result);
	assert!(holder.state().occupied_storage() <= 70_000);
	assert_eq!(holder.state().max_storage(), 70_000);

	// the smaller chunk goes first and is enough
	assert!(holder.state().has_chunk(&info.file_id, 0));
	assert!(!holder.state().has_chunk(&info.file_id, 1));

	let offered = timeout(Duration::from_secs(3), async {
		let mut offered = BTreeSet::new();
		while let Some((data, _)) = putchunks.next().await {
			let message = Message::decode(&data).unwrap();
			if message.kind == MessageType::Putchunk && message.file_id().unwrap() == info.file_id {
				assert_eq!(message.replication_degree().unwrap(), 1);
				assert_eq!(message.sender_id, holder.id());
				offered.insert(message.chunk_no().unwrap());
				break;
			}
		}
		offered
	}).await?;
	assert_eq!(offered, BTreeSet::from([1]));

	// the other peer takes it, the owner stays out
	assert!(wait_until(|| other.state().has_chunk(&info.file_id, 1), Duration::from_secs(3)).await);
	assert!(!p0.state().has_file_chunks(&info.file_id));
	// the owner counted the removal and the new copy
	assert!(wait_until(
		|| p0.state().file(&info.file_id).map_or(false, |f| f.chunks[&1] == 1),
		Duration::from_secs(3)
	).await);

	// storage never grows above the limit
	let result = holder.reclaim(0).await;
	assert!(result.success);
	assert_eq!(holder.state().occupied_storage(), 0);
	Ok(())
}

#[tokio::test]
async fn test_getchunk_answered_only_by_holders() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let dir = tempdir()?;
	let (p0, _m0) = spawn_peer(&network, local_node(9880, 1), test_config(dir.path(), ProtocolVersion::VANILLA), None).await?;
	let foreign = network.join(LOCALHOST);
	let factory = MessageFactory::new(ProtocolVersion::VANILLA, FOREIGN_ID);
	let mut restore = foreign.get(ChannelKind::Restore).subscribe();
	let file_id = "ab".repeat(32);

	foreign.control.send(factory.getchunk(&file_id, 0).encode()).await?;
	assert!(timeout(Duration::from_millis(1000), restore.next()).await.is_err());

	foreign.backup.send(factory.putchunk(&file_id, 0, 1, b"hello".to_vec()).encode()).await?;
	assert!(wait_until(|| p0.state().has_chunk(&file_id, 0), Duration::from_secs(2)).await);

	foreign.control.send(factory.getchunk(&file_id, 0).encode()).await?;
	let (data, _) = timeout(Duration::from_secs(2), restore.next()).await?.unwrap();
	let message = Message::decode(&data)?;
	assert_eq!(message.kind, MessageType::Chunk);
	assert_eq!(message.sender_id, p0.id());
	assert_eq!(message.chunk_no()?, 0);
	assert_eq!(message.body()?, b"hello");
	Ok(())
}

#[tokio::test]
async fn test_duplicate_stored_counts_once() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let dir = tempdir()?;
	let (p0, _m0) = spawn_peer(&network, local_node(9881, 1), test_config(dir.path(), ProtocolVersion::VANILLA), None).await?;
	let foreign = network.join(LOCALHOST);
	let factory = MessageFactory::new(ProtocolVersion::VANILLA, FOREIGN_ID);
	let other = MessageFactory::new(ProtocolVersion::VANILLA, FOREIGN_ID + 1);
	let file_id = "cd".repeat(32);

	foreign.backup.send(factory.putchunk(&file_id, 3, 3, vec![7; 1000]).encode()).await?;
	assert!(wait_until(|| p0.state().has_chunk(&file_id, 3), Duration::from_secs(2)).await);
	assert_eq!(p0.state().chunk(&file_id, 3).unwrap().perceived_degree, 1);
	// let the store finish registering its notifier
	sleep(Duration::from_millis(200)).await;

	let stored = factory.stored(&file_id, 3).encode();
	foreign.control.send(stored.clone()).await?;
	foreign.control.send(stored).await?;
	foreign.control.send(other.stored(&file_id, 3).encode()).await?;

	let degree = || p0.state().chunk(&file_id, 3).map_or(0, |c| c.perceived_degree);
	assert!(wait_until(|| degree() == 3, Duration::from_secs(2)).await);
	sleep(Duration::from_millis(300)).await;
	assert_eq!(degree(), 3);
	Ok(())
}

#[tokio::test]
async fn test_enhanced_peer_skips_satisfied_chunk() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let dir = tempdir()?;
	let (p0, _m0) = spawn_peer(&network, local_node(9882, 1), test_config(dir.path(), ProtocolVersion::ENHANCED), None).await?;
	let foreign = network.join(LOCALHOST);
	let factory = MessageFactory::new(ProtocolVersion::ENHANCED, FOREIGN_ID);
	let file_id = "ef".repeat(32);

	// the degree is reached during the backoff, so the chunk is not kept
	foreign.backup.send(factory.putchunk(&file_id, 0, 1, vec![1; 100]).encode()).await?;
	sleep(Duration::from_millis(100)).await;
	foreign.control.send(factory.stored(&file_id, 0).encode()).await?;
	sleep(Duration::from_millis(2800)).await;
	assert!(!p0.state().has_chunk(&file_id, 0));

	// nobody else stored this one
	foreign.backup.send(factory.putchunk(&file_id, 1, 1, vec![2; 100]).encode()).await?;
	assert!(wait_until(|| p0.state().has_chunk(&file_id, 1), Duration::from_secs(3)).await);
	Ok(())
}

#[tokio::test]
async fn test_late_putchunk_after_delete_is_ignored() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let dir = tempdir()?;
	let (p0, _m0) = spawn_peer(&network, local_node(9883, 1), test_config(dir.path(), ProtocolVersion::VANILLA), None).await?;
	let foreign = network.join(LOCALHOST);
	let factory = MessageFactory::new(ProtocolVersion::VANILLA, FOREIGN_ID);
	let file_id = "cc".repeat(32);

	// this peer never held the file
	foreign.control.send(factory.delete(&file_id).encode()).await?;
	assert!(wait_until(|| p0.state().is_deleted(&file_id), Duration::from_secs(2)).await);

	// a retry of the owner still in flight
	foreign.backup.send(factory.putchunk(&file_id, 0, 1, vec![3; 500]).encode()).await?;
	sleep(Duration::from_millis(500)).await;
	assert!(!p0.state().has_chunk(&file_id, 0));
	assert_eq!(p0.state().occupied_storage(), 0);
	Ok(())
}

#[tokio::test]
async fn test_putchunk_after_grace_revives_file() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let dir = tempdir()?;
	let config = chord_backup::core::Config {
		delete_grace: 300,
		..test_config(dir.path(), ProtocolVersion::VANILLA)
	};
	let (p0, _m0) = spawn_peer(&network, local_node(9884, 1), config, None).await?;
	let foreign = network.join(LOCALHOST);
	let factory = MessageFactory::new(ProtocolVersion::VANILLA, FOREIGN_ID);
	let file_id = "c0".repeat(32);

	foreign.control.send(factory.delete(&file_id).encode()).await?;
	assert!(wait_until(|| p0.state().is_deleted(&file_id), Duration::from_secs(2)).await);
	sleep(Duration::from_millis(500)).await;

	foreign.backup.send(factory.putchunk(&file_id, 0, 1, vec![3; 500]).encode()).await?;
	assert!(wait_until(|| p0.state().has_chunk(&file_id, 0), Duration::from_secs(2)).await);
	assert!(!p0.state().is_deleted(&file_id));
	Ok(())
}

#[tokio::test]
async fn test_malformed_file_id_is_dropped() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let dir = tempdir()?;
	let (p0, _m0) = spawn_peer(&network, local_node(9898, 1), test_config(dir.path(), ProtocolVersion::VANILLA), None).await?;
	let foreign = network.join(LOCALHOST);
	let factory = MessageFactory::new(ProtocolVersion::VANILLA, FOREIGN_ID);
	let file_id = "ab".repeat(32);

	foreign.backup.send(factory.putchunk(&file_id, 0, 1, b"kept".to_vec()).encode()).await?;
	assert!(wait_until(|| p0.state().has_chunk(&file_id, 0), Duration::from_secs(2)).await);

	foreign.control.send(b"1.0 DELETE 77 .. \r\n\r\n".to_vec()).await?;
	sleep(Duration::from_millis(300)).await;
	assert!(dir.path().exists());
	assert_eq!(p0.store().read_chunk(&file_id, 0)?, b"kept");
	assert!(!p0.state().is_deleted(".."));
	Ok(())
}

#[tokio::test]
async fn test_reclaim_evicts_smallest_first() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let dir = tempdir()?;
	let (p0, _m0) = spawn_peer(&network, local_node(9885, 1), test_config(dir.path(), ProtocolVersion::VANILLA), None).await?;
	let foreign = network.join(LOCALHOST);
	let factory = MessageFactory::new(ProtocolVersion::VANILLA, FOREIGN_ID);
	let (big, small) = ("b1".repeat(32), "5a".repeat(32));

	foreign.backup.send(factory.putchunk(&big, 0, 1, vec![1; 60_000]).encode()).await?;
	foreign.backup.send(factory.putchunk(&small, 0, 1, vec![2; 100]).encode()).await?;
	assert!(wait_until(
		|| p0.state().has_chunk(&big, 0) && p0.state().has_chunk(&small, 0),
		Duration::from_secs(2)
	).await);
	sleep(Duration::from_millis(200)).await;

	// the big chunk is over-replicated
	for id in [FOREIGN_ID + 1, FOREIGN_ID + 2] {
		let other = MessageFactory::new(ProtocolVersion::VANILLA, id);
		foreign.control.send(other.stored(&big, 0).encode()).await?;
	}
	assert!(wait_until(|| p0.state().chunk(&big, 0).map_or(0, |c| c.perceived_degree) == 3, Duration::from_secs(2)).await);

	let result = p0.reclaim(60_000).await;
	assert!(result.success, "{}", result);
	assert!(result.message.starts_with("Evicted 1 chunks"), "{}", result);
	assert!(p0.state().has_chunk(&big, 0));
	assert!(!p0.state().has_chunk(&small, 0));
	assert_eq!(p0.state().occupied_storage(), 60_000);
	Ok(())
}

#[tokio::test]
async fn test_reclaim_reports_unreadable_chunk() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let dir = tempdir()?;
	let (p0, _m0) = spawn_peer(&network, local_node(9886, 1), test_config(dir.path(), ProtocolVersion::VANILLA), None).await?;
	let foreign = network.join(LOCALHOST);
	let factory = MessageFactory::new(ProtocolVersion::VANILLA, FOREIGN_ID);
	let file_id = "de".repeat(32);

	foreign.backup.send(factory.putchunk(&file_id, 2, 1, vec![9; 1000]).encode()).await?;
	assert!(wait_until(|| p0.state().has_chunk(&file_id, 2), Duration::from_secs(2)).await);
	p0.store().delete_chunk(&file_id, 2)?;

	let result = p0.reclaim(0).await;
	assert!(result.success, "{}", result);
	assert!(result.message.contains(&format!("could not replicate {}:2 again", file_id)), "{}", result);
	assert_eq!(p0.state().occupied_storage(), 0);
	Ok(())
}

#[tokio::test]
async fn test_ring_backup_removes_trailing_pointers() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let (files, dirs) = (tempdir()?, [tempdir()?, tempdir()?, tempdir()?]);
	let path = files.path().join("ledger.db");
	let data = test_data(30_000);
	fs::write(&path, &data)?;
	let file_id = generate_file_id(&path)?;
	let key = calculate_hash(file_id.as_bytes());

	// p1 is responsible for the file, p2 comes after it and is full
	let config = |i: usize| test_config(dirs[i].path(), ProtocolVersion::VANILLA);
	let (p0, _m0) = spawn_peer(&network, local_node(9887, key.wrapping_sub(Digest::MAX / 3)), config(0), None).await?;
	let (p1, _m1) = spawn_peer(&network, local_node(9888, key), config(1), Some(&p0)).await?;
	let (p2, _m2) = spawn_peer(&network, local_node(9889, key.wrapping_add(Digest::MAX / 3)), config(2), Some(&p0)).await?;
	let peers = [p0.clone(), p1.clone(), p2.clone()];
	stabilize_ring(&peers).await;
	p2.state().set_max_storage(10);

	let result = p0.backup(&path, 2).await;
	assert!(result.success, "{}", result);
	assert_eq!(p1.state().file_chunks(&file_id).len(), 1);
	assert!(!p2.state().has_file_chunks(&file_id));
	// p2 redirected after the last holder, so its pointer led nowhere
	assert!(!p2.state().is_pointer(&file_id));

	let result = p0.restore("ledger.db").await;
	assert!(result.success, "{}", result);
	assert_eq!(fs::read(p0.store().restored_path("ledger.db"))?, data);
	Ok(())
}

#[tokio::test]
async fn test_enhanced_chunk_sent_over_tcp() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let dir = tempdir()?;
	let (p0, _m0) = spawn_peer(&network, local_node(9890, 1), test_config(dir.path(), ProtocolVersion::ENHANCED), None).await?;
	let foreign = network.join(LOCALHOST);
	let enhanced = MessageFactory::new(ProtocolVersion::ENHANCED, FOREIGN_ID);
	let vanilla = MessageFactory::new(ProtocolVersion::VANILLA, FOREIGN_ID);
	let mut restore = foreign.get(ChannelKind::Restore).subscribe();
	let file_id = "7e".repeat(32);
	let data = test_data(5000);

	foreign.backup.send(enhanced.putchunk(&file_id, 0, 1, data.clone()).encode()).await?;
	assert!(wait_until(|| p0.state().has_chunk(&file_id, 0), Duration::from_secs(4)).await);

	// an enhanced requester gets a port and fetches the data itself
	foreign.control.send(enhanced.getchunk(&file_id, 0).encode()).await?;
	let (reply, _) = timeout(Duration::from_secs(2), restore.next()).await?.unwrap();
	let message = Message::decode(&reply)?;
	assert_eq!(message.kind, MessageType::Chunk);
	assert_eq!(message.version, ProtocolVersion::ENHANCED);
	let port: u16 = std::str::from_utf8(message.body()?)?.trim().parse()?;
	let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
	let mut fetched = Vec::new();
	stream.read_to_end(&mut fetched).await?;
	assert_eq!(fetched, data);

	// a vanilla requester cannot, so the data goes on the channel
	foreign.control.send(vanilla.getchunk(&file_id, 0).encode()).await?;
	let (reply, _) = timeout(Duration::from_secs(2), restore.next()).await?.unwrap();
	let message = Message::decode(&reply)?;
	assert_eq!(message.kind, MessageType::Chunk);
	assert_eq!(message.version, ProtocolVersion::VANILLA);
	assert_eq!(message.body()?, &data[..]);
	Ok(())
}

#[tokio::test]
async fn test_restore_falls_back_to_getchunk() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let (files, dirs) = (tempdir()?, [tempdir()?, tempdir()?, tempdir()?]);
	let config = |i: usize| test_config(dirs[i].path(), ProtocolVersion::ENHANCED);
	let (p0, _m0) = spawn_peer(&network, local_node(9891, 0), config(0), None).await?;
	let (p1, _m1) = spawn_peer(&network, local_node(9892, Digest::MAX / 3), config(1), Some(&p0)).await?;
	let (p2, _m2) = spawn_peer(&network, local_node(9893, Digest::MAX / 3 * 2), config(2), Some(&p0)).await?;
	let peers = [p0.clone(), p1.clone(), p2.clone()];
	stabilize_ring(&peers).await;

	let path = files.path().join("thesis.pdf");
	let data = test_data(90_000);
	fs::write(&path, &data)?;
	assert!(p0.backup(&path, 1).await.success);
	let info = p0.state().file_by_name("thesis.pdf").unwrap();

	// split the copy: chunk 1 moves to the other peer
	let holder = holders(&peers, &info.file_id)[0].clone();
	let other = if holder.id() == p1.id() { p2.clone() } else { p1.clone() };
	assert!(holder.reclaim(70_000).await.success);
	assert!(wait_until(|| other.state().has_chunk(&info.file_id, 1), Duration::from_secs(5)).await);
	assert!(holder.state().has_chunk(&info.file_id, 0));

	// no ring node can send the whole file any more
	let mut control = network.join(LOCALHOST).control.subscribe();
	let result = p0.restore("thesis.pdf").await;
	assert!(result.success, "{}", result);
	assert_eq!(fs::read(p0.store().restored_path("thesis.pdf"))?, data);

	let asked: BTreeSet<u32> = drain(&mut control, Duration::from_millis(100)).await.into_iter()
		.filter(|m| m.kind == MessageType::Getchunk && m.sender_id == p0.id())
		.map(|m| m.chunk_no().unwrap())
		.collect();
	assert!(asked.contains(&0) && asked.contains(&1), "{:?}", asked);
	Ok(())
}

#[tokio::test]
async fn test_filecheck_announces_delete() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let dir = tempdir()?;
	let (p0, _m0) = spawn_peer(&network, local_node(9894, 1), test_config(dir.path(), ProtocolVersion::ENHANCED), None).await?;
	let foreign = network.join(LOCALHOST);
	let factory = MessageFactory::new(ProtocolVersion::VANILLA, FOREIGN_ID);
	let returning = MessageFactory::new(ProtocolVersion::ENHANCED, FOREIGN_ID + 1);
	let mut control = foreign.control.subscribe();
	let file_id = "fc".repeat(32);

	foreign.control.send(factory.delete(&file_id).encode()).await?;
	assert!(wait_until(|| p0.state().is_deleted(&file_id), Duration::from_secs(2)).await);

	foreign.control.send(returning.filecheck(&file_id).encode()).await?;
	let deletes = |messages: Vec<Message>| messages.into_iter()
		.filter(|m| m.kind == MessageType::Delete && m.sender_id == p0.id())
		.count();
	assert_eq!(deletes(drain(&mut control, Duration::from_millis(1000)).await), 1);

	// another peer answers first
	foreign.control.send(returning.filecheck(&file_id).encode()).await?;
	settle().await;
	foreign.control.send(factory.delete(&file_id).encode()).await?;
	assert_eq!(deletes(drain(&mut control, Duration::from_millis(1000)).await), 0);
	Ok(())
}

#[tokio::test]
async fn test_backup_nobody_stores_fails() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let (files, dirs) = (tempdir()?, [tempdir()?, tempdir()?]);
	let config = |i: usize| test_config(dirs[i].path(), ProtocolVersion::VANILLA);
	let (p0, _m0) = spawn_peer(&network, local_node(9895, 0), config(0), None).await?;
	let (p1, _m1) = spawn_peer(&network, local_node(9896, Digest::MAX / 2), config(1), Some(&p0)).await?;
	stabilize_ring(&[p0.clone(), p1.clone()]).await;
	p1.state().set_max_storage(0);

	let path = files.path().join("big.iso");
	fs::write(&path, test_data(1000))?;
	let file_id = generate_file_id(&path)?;
	let mut backup = network.join(LOCALHOST).backup.subscribe();

	let result = p0.backup(&path, 1).await;
	assert!(!result.success, "{}", result);
	assert!(!p0.state().owns_file(&file_id));
	assert!(p0.state().file_by_name("big.iso").is_none());
	assert!(p0.state().is_deleted(&file_id));
	assert!(!p1.state().has_file_chunks(&file_id));
	assert!(!p1.state().is_pointer(&file_id));

	let offers = drain(&mut backup, Duration::from_millis(100)).await.into_iter()
		.filter(|m| m.kind == MessageType::Putchunk && m.sender_id == p0.id())
		.count();
	assert_eq!(offers, 5);
	Ok(())
}

#[tokio::test]
async fn test_removed_copy_is_replicated_again() -> anyhow::Result<()> {
	init_logger();
	let network = LocalNetwork::new();
	let dir = tempdir()?;
	let (p0, _m0) = spawn_peer(&network, local_node(9897, 1), test_config(dir.path(), ProtocolVersion::VANILLA), None).await?;
	let foreign = network.join(LOCALHOST);
	let owner = MessageFactory::new(ProtocolVersion::VANILLA, FOREIGN_ID);
	let other = MessageFactory::new(ProtocolVersion::VANILLA, FOREIGN_ID + 1);
	let mut backup = foreign.backup.subscribe();
	let file_id = "4e".repeat(32);

	for chunk_no in [0, 1] {
		foreign.backup.send(owner.putchunk(&file_id, chunk_no, 2, vec![5; 200]).encode()).await?;
	}
	assert!(wait_until(
		|| p0.state().has_chunk(&file_id, 0) && p0.state().has_chunk(&file_id, 1),
		Duration::from_secs(2)
	).await);
	sleep(Duration::from_millis(200)).await;
	for chunk_no in [0, 1] {
		foreign.control.send(other.stored(&file_id, chunk_no).encode()).await?;
	}
	assert!(wait_until(
		|| [0, 1].iter().all(|&no| p0.state().chunk(&file_id, no).map_or(0, |c| c.perceived_degree) == 2),
		Duration::from_secs(2)
	).await);
	drain(&mut backup, Duration::from_millis(50)).await;

	// chunk 0 lost a copy and nobody else restarts it
	foreign.control.send(other.removed(&file_id, 0).encode()).await?;
	// chunk 1 lost a copy but another peer is already on it
	foreign.control.send(other.removed(&file_id, 1).encode()).await?;
	settle().await;
	foreign.backup.send(owner.putchunk(&file_id, 1, 2, vec![5; 200]).encode()).await?;

	let offered: Vec<u32> = drain(&mut backup, Duration::from_millis(1500)).await.into_iter()
		.filter(|m| m.kind == MessageType::Putchunk && m.sender_id == p0.id())
		.map(|m| m.chunk_no().unwrap())
		.collect();
	assert!(offered.contains(&0), "{:?}", offered);
	assert!(!offered.contains(&1), "{:?}", offered);
	assert_eq!(p0.state().chunk(&file_id, 1).unwrap().perceived_degree, 1);
	Ok(())
}
