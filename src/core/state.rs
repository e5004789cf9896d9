use std::{
	collections::{BTreeMap, HashMap, HashSet},
	fmt,
	fs,
	path::{Path, PathBuf},
	sync::{Arc, Mutex},
	time::{Duration, SystemTime, UNIX_EPOCH}
};
use log::{error, info};
use serde::{Serialize, Deserialize};
use super::{
	error::BackupResult,
	message::FileId
};

const STATE_FILE: &str = "metadata.json";

/// A file this peer backed up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
	pub file_name: String,
	pub file_id: FileId,
	pub desired_degree: u32,
	pub byte_amount: u64,
	/// chunk number -> perceived replication degree
	pub chunks: BTreeMap<u32, u32>
}

/// A chunk this peer stores for another peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
	pub file_id: FileId,
	pub chunk_no: u32,
	pub size: u64,
	pub desired_degree: u32,
	pub perceived_degree: u32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
	files: HashMap<FileId, FileInfo>,
	names: HashMap<String, FileId>,
	stored: HashMap<FileId, BTreeMap<u32, ChunkInfo>>,
	// file id -> unix time in ms when the deletion was seen
	deleted: HashMap<FileId, u64>,
	// files stored further along the ring that this peer redirects to
	pointers: HashSet<FileId>,
	// -1 for unlimited
	max_storage: i64
}

impl Default for Snapshot {
	fn default() -> Self {
		Self {
			files: HashMap::new(),
			names: HashMap::new(),
			stored: HashMap::new(),
			deleted: HashMap::new(),
			pointers: HashSet::new(),
			max_storage: -1
		}
	}
}

impl Snapshot {
	fn occupied(&self) -> u64 {
		self.stored.values()
			.flat_map(|chunks| chunks.values())
			.map(|c| c.size)
			.sum()
	}

	fn fits(&self, bytes: u64) -> bool {
		self.max_storage < 0 || self.occupied() + bytes <= self.max_storage as u64
	}

	fn chunk_mut(&mut self, file_id: &str, chunk_no: u32) -> Option<&mut ChunkInfo> {
		self.stored.get_mut(file_id).and_then(|chunks| chunks.get_mut(&chunk_no))
	}

	fn file_chunk_mut(&mut self, file_id: &str, chunk_no: u32) -> Option<&mut u32> {
		self.files.get_mut(file_id).and_then(|f| f.chunks.get_mut(&chunk_no))
	}
}

/// Durable record of owned files, stored chunks and the storage quota.
/// Every mutation is written through to disk.
#[derive(Clone)]
pub struct PeerState {
	path: Arc<PathBuf>,
	inner: Arc<Mutex<Snapshot>>
}

impl PeerState {
	/// Load the state kept in a directory, or start a fresh one
	pub fn load(dir: &Path) -> BackupResult<Self> {
		fs::create_dir_all(dir)?;
		let path = dir.join(STATE_FILE);
		let snapshot = if path.exists() {
			serde_json::from_slice(&fs::read(&path)?)?
		}
		else {
			info!("No state found in {}, starting fresh", dir.display());
			Snapshot::default()
		};
		Ok(Self {
			path: Arc::new(path),
			inner: Arc::new(Mutex::new(snapshot))
		})
	}

	fn persist(&self, snapshot: &Snapshot) -> BackupResult<()> {
		let data = serde_json::to_vec_pretty(snapshot)?;
		let tmp = self.path.with_extension("json.tmp");
		fs::write(&tmp, data)?;
		fs::rename(&tmp, self.path.as_ref())?;
		Ok(())
	}

	fn mutate<R>(&self, f: impl FnOnce(&mut Snapshot) -> R) -> R {
		let mut snapshot = self.inner.lock().unwrap();
		let result = f(&mut snapshot);
		if let Err(e) = self.persist(&snapshot) {
			error!("Failed to persist state to {}: {}", self.path.display(), e);
		}
		result
	}

	fn read<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> R {
		let snapshot = self.inner.lock().unwrap();
		f(&snapshot)
	}

	pub fn max_storage(&self) -> i64 {
		self.read(|s| s.max_storage)
	}

	/// Negative values mean unlimited
	pub fn set_max_storage(&self, bytes: i64) {
		self.mutate(|s| s.max_storage = bytes.max(-1));
	}

	pub fn occupied_storage(&self) -> u64 {
		self.read(|s| s.occupied())
	}

	pub fn has_space_for(&self, bytes: u64) -> bool {
		self.read(|s| s.fits(bytes))
	}

	/// Store a chunk if it is new and fits in the quota
	pub fn admit_chunk(&self, chunk: ChunkInfo) -> bool {
		self.mutate(|s| {
			let held = s.stored.get(&chunk.file_id)
				.map_or(false, |chunks| chunks.contains_key(&chunk.chunk_no));
			if held || !s.fits(chunk.size) {
				return false;
			}
			s.stored.entry(chunk.file_id.clone())
				.or_default()
				.insert(chunk.chunk_no, chunk);
			true
		})
	}

	pub fn has_chunk(&self, file_id: &str, chunk_no: u32) -> bool {
		self.chunk(file_id, chunk_no).is_some()
	}

	pub fn chunk(&self, file_id: &str, chunk_no: u32) -> Option<ChunkInfo> {
		self.read(|s| s.stored.get(file_id).and_then(|c| c.get(&chunk_no)).cloned())
	}

	pub fn has_file_chunks(&self, file_id: &str) -> bool {
		self.read(|s| s.stored.get(file_id).map_or(false, |c| !c.is_empty()))
	}

	/// Chunks stored for a file, by chunk number
	pub fn file_chunks(&self, file_id: &str) -> Vec<ChunkInfo> {
		self.read(|s| s.stored.get(file_id)
			.map(|c| c.values().cloned().collect())
			.unwrap_or_default())
	}

	pub fn stored_chunks(&self) -> Vec<ChunkInfo> {
		self.read(|s| s.stored.values()
			.flat_map(|c| c.values().cloned())
			.collect())
	}

	pub fn stored_file_ids(&self) -> Vec<FileId> {
		self.read(|s| s.stored.keys().cloned().collect())
	}

	pub fn remove_chunk(&self, file_id: &str, chunk_no: u32) -> Option<ChunkInfo> {
		self.mutate(|s| {
			let chunks = s.stored.get_mut(file_id)?;
			let removed = chunks.remove(&chunk_no);
			if chunks.is_empty() {
				s.stored.remove(file_id);
			}
			removed
		})
	}

	pub fn remove_file_chunks(&self, file_id: &str) -> Vec<ChunkInfo> {
		self.mutate(|s| s.stored.remove(file_id)
			.map(|c| c.into_values().collect())
			.unwrap_or_default())
	}

	pub fn set_chunk_perceived(&self, file_id: &str, chunk_no: u32, degree: u32) {
		self.mutate(|s| if let Some(c) = s.chunk_mut(file_id, chunk_no) {
			c.perceived_degree = degree;
		});
	}

	pub fn raise_chunk_perceived(&self, file_id: &str, chunk_no: u32, degree: u32) {
		self.mutate(|s| if let Some(c) = s.chunk_mut(file_id, chunk_no) {
			c.perceived_degree = c.perceived_degree.max(degree);
		});
	}

	/// Returns the new perceived degree if the chunk is stored here
	pub fn decrement_chunk_perceived(&self, file_id: &str, chunk_no: u32) -> Option<u32> {
		self.mutate(|s| s.chunk_mut(file_id, chunk_no).map(|c| {
			c.perceived_degree = c.perceived_degree.saturating_sub(1);
			c.perceived_degree
		}))
	}

	/// Record a backed up file.
	/// Returns the file previously backed up under the same name.
	pub fn add_file(&self, info: FileInfo) -> Option<FileInfo> {
		self.mutate(|s| {
			let previous = s.names.insert(info.file_name.clone(), info.file_id.clone())
				.filter(|id| *id != info.file_id)
				.and_then(|id| s.files.remove(&id));
			s.files.insert(info.file_id.clone(), info);
			previous
		})
	}

	pub fn remove_file(&self, file_id: &str) -> Option<FileInfo> {
		self.mutate(|s| {
			let info = s.files.remove(file_id)?;
			if s.names.get(&info.file_name).map_or(false, |id| id == file_id) {
				s.names.remove(&info.file_name);
			}
			Some(info)
		})
	}

	pub fn owns_file(&self, file_id: &str) -> bool {
		self.read(|s| s.files.contains_key(file_id))
	}

	pub fn file(&self, file_id: &str) -> Option<FileInfo> {
		self.read(|s| s.files.get(file_id).cloned())
	}

	pub fn file_by_name(&self, name: &str) -> Option<FileInfo> {
		self.read(|s| s.names.get(name).and_then(|id| s.files.get(id)).cloned())
	}

	pub fn set_file_chunk_perceived(&self, file_id: &str, chunk_no: u32, degree: u32) {
		self.mutate(|s| if let Some(d) = s.file_chunk_mut(file_id, chunk_no) {
			*d = degree;
		});
	}

	pub fn increment_file_chunk_perceived(&self, file_id: &str, chunk_no: u32) {
		self.mutate(|s| if let Some(d) = s.file_chunk_mut(file_id, chunk_no) {
			*d += 1;
		});
	}

	pub fn decrement_file_chunk_perceived(&self, file_id: &str, chunk_no: u32) -> Option<u32> {
		self.mutate(|s| s.file_chunk_mut(file_id, chunk_no).map(|d| {
			*d = d.saturating_sub(1);
			*d
		}))
	}

	pub fn add_deleted(&self, file_id: &str) {
		let now = unix_millis();
		self.mutate(|s| s.deleted.insert(file_id.to_string(), now));
	}

	pub fn remove_deleted(&self, file_id: &str) {
		self.mutate(|s| s.deleted.remove(file_id));
	}

	pub fn is_deleted(&self, file_id: &str) -> bool {
		self.read(|s| s.deleted.contains_key(file_id))
	}

	/// Whether the file was marked deleted less than `window` ago
	pub fn deleted_within(&self, file_id: &str, window: Duration) -> bool {
		let now = unix_millis();
		self.read(|s| s.deleted.get(file_id)
			.map_or(false, |&at| now.saturating_sub(at) < window.as_millis() as u64))
	}

	pub fn add_pointer(&self, file_id: &str) {
		self.mutate(|s| s.pointers.insert(file_id.to_string()));
	}

	pub fn remove_pointer(&self, file_id: &str) {
		self.mutate(|s| s.pointers.remove(file_id));
	}

	pub fn is_pointer(&self, file_id: &str) -> bool {
		self.read(|s| s.pointers.contains(file_id))
	}
}

fn unix_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map_or(0, |d| d.as_millis() as u64)
}

impl fmt::Display for PeerState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = self.inner.lock().unwrap();
		if s.max_storage < 0 {
			writeln!(f, "Storage: {} B used (unlimited)", s.occupied())?;
		}
		else {
			writeln!(f, "Storage: {} B used of {} B", s.occupied(), s.max_storage)?;
		}

		writeln!(f, "Backed up files:")?;
		let mut files: Vec<&FileInfo> = s.files.values().collect();
		files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
		for file in files {
			writeln!(f, "  {} ({}) desired degree {}", file.file_name, file.file_id, file.desired_degree)?;
			for (no, degree) in &file.chunks {
				writeln!(f, "    chunk {} perceived degree {}", no, degree)?;
			}
		}

		writeln!(f, "Stored chunks:")?;
		let mut ids: Vec<&FileId> = s.stored.keys().collect();
		ids.sort();
		for id in ids {
			for chunk in s.stored[id].values() {
				writeln!(
					f,
					"  {}:{} {} B, perceived degree {} of {}",
					chunk.file_id,
					chunk.chunk_no,
					chunk.size,
					chunk.perceived_degree,
					chunk.desired_degree
				)?;
			}
		}
		Ok(())
	}
}
