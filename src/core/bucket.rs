use std::{
	collections::{BTreeMap, HashMap},
	sync::{Arc, Mutex},
	time::{Duration, Instant}
};
use log::warn;
use super::message::FileId;

pub type OnComplete = Box<dyn FnOnce(Vec<Vec<u8>>) + Send>;

/// Collects the parts of one file until all of them arrived
pub struct FileBucket {
	goal: usize,
	parts: Mutex<BTreeMap<u32, Vec<u8>>>,
	on_complete: Mutex<Option<OnComplete>>,
	last_activity: Mutex<Instant>
}

impl FileBucket {
	pub fn new<F>(goal: usize, on_complete: F) -> Self
	where F: FnOnce(Vec<Vec<u8>>) + Send + 'static {
		Self {
			goal,
			parts: Mutex::new(BTreeMap::new()),
			on_complete: Mutex::new(Some(Box::new(on_complete))),
			last_activity: Mutex::new(Instant::now())
		}
	}

	/// Add a part, running the completion when it was the last one missing.
	/// Returns whether the bucket is complete.
	pub fn add(&self, order: u32, data: Vec<u8>) -> bool {
		*self.last_activity.lock().unwrap() = Instant::now();
		let parts = {
			let mut parts = self.parts.lock().unwrap();
			parts.entry(order).or_insert(data);
			if parts.len() < self.goal {
				return false;
			}
			std::mem::take(&mut *parts)
		};
		if let Some(on_complete) = self.on_complete.lock().unwrap().take() {
			on_complete(parts.into_values().collect());
		}
		true
	}

	pub fn idle_for(&self) -> Duration {
		self.last_activity.lock().unwrap().elapsed()
	}
}

/// File buckets in progress, by file id
#[derive(Clone, Default)]
pub struct DataBucket {
	buckets: Arc<Mutex<HashMap<FileId, Arc<FileBucket>>>>
}

impl DataBucket {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, file_id: &str, bucket: Arc<FileBucket>) {
		self.buckets.lock().unwrap().insert(file_id.to_string(), bucket);
	}

	pub fn remove(&self, file_id: &str) -> Option<Arc<FileBucket>> {
		self.buckets.lock().unwrap().remove(file_id)
	}

	pub fn contains(&self, file_id: &str) -> bool {
		self.buckets.lock().unwrap().contains_key(file_id)
	}

	/// Route a part to its bucket.
	/// Returns false if no bucket expects this file.
	pub fn add_part(&self, file_id: &str, order: u32, data: Vec<u8>) -> bool {
		let bucket = match self.buckets.lock().unwrap().get(file_id) {
			Some(b) => b.clone(),
			None => return false
		};
		if bucket.add(order, data) {
			let mut buckets = self.buckets.lock().unwrap();
			if buckets.get(file_id).map_or(false, |b| Arc::ptr_eq(b, &bucket)) {
				buckets.remove(file_id);
			}
		}
		true
	}

	/// Drop the bucket of a file once it stays idle for too long
	pub fn expire_when_idle(&self, file_id: &str, idle: Duration) {
		let buckets = self.clone();
		let file_id = file_id.to_string();
		tokio::spawn(async move {
			loop {
				tokio::time::sleep(idle).await;
				let bucket = match buckets.buckets.lock().unwrap().get(&file_id) {
					Some(b) => b.clone(),
					None => return
				};
				if bucket.idle_for() >= idle {
					warn!("Transfer of file {} went idle, dropping it", file_id);
					buckets.remove(&file_id);
					return;
				}
			}
		});
	}
}
