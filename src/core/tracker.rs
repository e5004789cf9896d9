use std::{
	collections::{HashMap, HashSet},
	process,
	sync::{
		Arc,
		Mutex,
		atomic::{AtomicBool, Ordering}
	}
};
use log::error;
use super::ring::Digest;

/// Called with the new participant count of its key
pub type Notifier = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct Entries {
	participants: HashMap<String, HashSet<Digest>>,
	notifiers: HashMap<String, Notifier>,
	// None while waiting for the payload
	payloads: HashMap<String, Option<Vec<u8>>>
}

/// Acknowledgements collected for one in-flight operation
pub struct Tracker {
	family: &'static str,
	active: AtomicBool,
	entries: Mutex<Entries>
}

impl Tracker {
	fn new(family: &'static str) -> Self {
		Self {
			family,
			active: AtomicBool::new(true),
			entries: Mutex::new(Entries::default())
		}
	}

	// A disposed tracker in use means a broken operation, not a runtime condition
	fn check_active(&self) {
		if !self.active.load(Ordering::SeqCst) {
			error!("{} tracker used after disposal", self.family);
			process::abort();
		}
	}

	fn record(&self, key: &str, participant: Digest) {
		self.check_active();
		let mut guard = self.entries.lock().unwrap();
		let entries = &mut *guard;
		let participants = entries.participants.entry(key.to_string()).or_default();
		if participants.insert(participant) {
			let count = participants.len();
			if let Some(notifier) = entries.notifiers.get(key) {
				notifier(count);
			}
		}
	}

	fn store_payload(&self, key: &str, data: &[u8]) {
		let mut entries = self.entries.lock().unwrap();
		if let Some(payload) = entries.payloads.get_mut(key) {
			if payload.is_none() {
				*payload = Some(data.to_vec());
			}
		}
	}

	pub fn count(&self, key: &str) -> usize {
		self.check_active();
		let entries = self.entries.lock().unwrap();
		entries.participants.get(key).map_or(0, |p| p.len())
	}

	pub fn contains(&self, key: &str) -> bool {
		self.count(key) > 0
	}

	/// Install the notifier of a key, replacing the previous one
	pub fn add_notifier<F>(&self, key: &str, notifier: F)
	where F: Fn(usize) + Send + Sync + 'static {
		self.check_active();
		let mut entries = self.entries.lock().unwrap();
		entries.notifiers.insert(key.to_string(), Box::new(notifier));
	}

	/// Register interest in the payload of a key
	pub fn wait_for(&self, key: &str) {
		self.check_active();
		let mut entries = self.entries.lock().unwrap();
		entries.payloads.entry(key.to_string()).or_insert(None);
	}

	pub fn is_waiting(&self, key: &str) -> bool {
		self.check_active();
		let entries = self.entries.lock().unwrap();
		matches!(entries.payloads.get(key), Some(None))
	}

	pub fn has_payload(&self, key: &str) -> bool {
		self.check_active();
		let entries = self.entries.lock().unwrap();
		matches!(entries.payloads.get(key), Some(Some(_)))
	}

	/// Hand over a received payload, which ends the interest in the key
	pub fn take_payload(&self, key: &str) -> Option<Vec<u8>> {
		self.check_active();
		let mut entries = self.entries.lock().unwrap();
		match entries.payloads.get(key) {
			Some(Some(_)) => entries.payloads.remove(key).flatten(),
			_ => None
		}
	}
}

/// Registry of the live trackers of one kind.
/// Every acknowledgement reaches all of them.
pub struct TrackerFamily {
	name: &'static str,
	live: Mutex<Vec<Arc<Tracker>>>
}

impl TrackerFamily {
	pub fn new(name: &'static str) -> Self {
		Self {
			name,
			live: Mutex::new(Vec::new())
		}
	}

	pub fn track(&self) -> Arc<Tracker> {
		let tracker = Arc::new(Tracker::new(self.name));
		self.live.lock().unwrap().push(tracker.clone());
		tracker
	}

	pub fn dispose(&self, tracker: &Arc<Tracker>) {
		let mut live = self.live.lock().unwrap();
		tracker.check_active();
		tracker.active.store(false, Ordering::SeqCst);
		live.retain(|t| !Arc::ptr_eq(t, tracker));
	}

	// delivered under the family lock so disposal never races a record
	pub fn record(&self, key: &str, participant: Digest) {
		let live = self.live.lock().unwrap();
		for tracker in live.iter() {
			tracker.record(key, participant);
		}
	}

	/// Record a chunk acknowledgement, keeping its payload for trackers waiting on it
	pub fn record_payload(&self, key: &str, participant: Digest, data: Option<&[u8]>) {
		let live = self.live.lock().unwrap();
		for tracker in live.iter() {
			if let Some(data) = data {
				tracker.store_payload(key, data);
			}
			tracker.record(key, participant);
		}
	}

	pub fn is_waiting(&self, key: &str) -> bool {
		let live = self.live.lock().unwrap();
		live.iter().any(|t| t.is_waiting(key))
	}

	pub fn live_count(&self) -> usize {
		self.live.lock().unwrap().len()
	}
}

pub struct Trackers {
	pub stored: TrackerFamily,
	pub chunk: TrackerFamily,
	pub delete: TrackerFamily,
	pub putchunk: TrackerFamily
}

impl Trackers {
	pub fn new() -> Self {
		Self {
			stored: TrackerFamily::new("stored"),
			chunk: TrackerFamily::new("chunk"),
			delete: TrackerFamily::new("delete"),
			putchunk: TrackerFamily::new("putchunk")
		}
	}
}

impl Default for Trackers {
	fn default() -> Self {
		Self::new()
	}
}
