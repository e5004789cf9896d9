use std::mem::size_of;
use serde::{Serialize, Deserialize};

pub type Digest = u32;
// number of bits
pub const NUM_BITS: usize = size_of::<Digest>() * 8;

// Strictly in range: id in (start, end)
pub fn in_range(id: Digest, start: Digest, end: Digest) -> bool {
	if end > start {
		// (start, id, end)
		id > start && id < end
	}
	else {
		// end <= start
		// case 1: (start, id, end + MAX_VAL)
		// case 2: (start, id + MAX_VAL, end + MAX_VAL)
		id > start || id < end
	}
}

// id in (start, end]
pub fn in_range_incl(id: Digest, start: Digest, end: Digest) -> bool {
	in_range(id, start, end) || id == end
}

/// Position of a peer on the ring
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChordNode {
	pub id: Digest,
	pub addr: String
}

impl std::fmt::Display for ChordNode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Node({}, {})", self.id, self.addr)
	}
}
