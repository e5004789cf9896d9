use std::{fmt, str::{FromStr, SplitAsciiWhitespace}};
use thiserror::Error;
use super::{
	MAX_CHUNK_NO,
	ring::{ChordNode, Digest}
};

pub type FileId = String;

/// File ids are lowercase hex digests, so they are safe as path names
pub fn is_valid_file_id(id: &str) -> bool {
	id.len() == FILE_ID_LEN && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

const SENTINEL: &[u8] = b"\r\n\r\n";
/// Length of a hex encoded SHA-256 file id
pub const FILE_ID_LEN: usize = 64;
const NULL_NODE: &str = "NULL";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
	#[error("Header terminator not found")]
	MissingSentinel,
	#[error("Header is not valid text")]
	InvalidHeader,
	#[error("Unknown message type {0}")]
	UnknownMessageType(String),
	#[error("Invalid protocol version {0}")]
	InvalidVersion(String),
	#[error("Header is missing {0}")]
	MissingField(&'static str),
	#[error("Invalid {field}: {value}")]
	InvalidField {
		field: &'static str,
		value: String
	},
	#[error("Message has no {0}")]
	FieldNotPresent(&'static str)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
	pub major: u8,
	pub minor: u8
}

impl ProtocolVersion {
	pub const VANILLA: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
	pub const ENHANCED: ProtocolVersion = ProtocolVersion { major: 1, minor: 1 };

	pub fn is_vanilla(&self) -> bool {
		*self == Self::VANILLA
	}
}

impl FromStr for ProtocolVersion {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let invalid = || ParseError::InvalidVersion(s.to_string());
		let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
		let digit = |part: &str| match part.as_bytes() {
			[d] if d.is_ascii_digit() => Ok(d - b'0'),
			_ => Err(invalid())
		};
		let version = ProtocolVersion {
			major: digit(major)?,
			minor: digit(minor)?
		};
		if version.major == 0 && version.minor == 0 {
			return Err(invalid());
		}
		Ok(version)
	}
}

impl fmt::Display for ProtocolVersion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.major, self.minor)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
	// broadcast replication protocol
	Putchunk,
	Stored,
	Getchunk,
	Chunk,
	Delete,
	Removed,
	Filecheck,
	// point-to-point ring protocol
	Lookup,
	Node,
	Redirect,
	GetPredecessor,
	GetSuccessor,
	Notify,
	ProcessedYes,
	ProcessedNo,
	Putfile,
	Data,
	Getfile,
	RemovePointer
}

/// Header fields following the sender id, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
	FileId,
	Key,
	ChunkNo,
	ReplicationDegree,
	PerceivedDegree,
	Parts,
	ByteAmount,
	Node,
	OptionalNode
}

impl MessageType {
	pub fn as_str(&self) -> &'static str {
		use MessageType::*;
		match self {
			Putchunk => "PUTCHUNK",
			Stored => "STORED",
			Getchunk => "GETCHUNK",
			Chunk => "CHUNK",
			Delete => "DELETE",
			Removed => "REMOVED",
			Filecheck => "FILECHECK",
			Lookup => "LOOKUP",
			Node => "NODE",
			Redirect => "REDIRECT",
			GetPredecessor => "GETPREDECESSOR",
			GetSuccessor => "GETSUCCESSOR",
			Notify => "NOTIFY",
			ProcessedYes => "PROCESSEDYES",
			ProcessedNo => "PROCESSEDNO",
			Putfile => "PUTFILE",
			Data => "DATA",
			Getfile => "GETFILE",
			RemovePointer => "REMOVEPOINTER"
		}
	}

	fn fields(&self) -> &'static [Field] {
		use MessageType::*;
		match self {
			Putchunk => &[Field::FileId, Field::ChunkNo, Field::ReplicationDegree],
			Stored | Getchunk | Removed | Chunk | Data => &[Field::FileId, Field::ChunkNo],
			Delete | Filecheck | RemovePointer => &[Field::FileId],
			Lookup => &[Field::Key],
			Node => &[Field::OptionalNode],
			Redirect | Notify => &[Field::Node],
			Putfile => &[
				Field::FileId,
				Field::Parts,
				Field::ReplicationDegree,
				Field::PerceivedDegree,
				Field::ByteAmount
			],
			Getfile => &[Field::FileId, Field::Node],
			GetPredecessor | GetSuccessor | ProcessedYes | ProcessedNo => &[]
		}
	}

	pub fn has_body(&self) -> bool {
		matches!(self, MessageType::Putchunk | MessageType::Chunk | MessageType::Data)
	}
}

impl FromStr for MessageType {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		use MessageType::*;
		Ok(match s {
			"PUTCHUNK" => Putchunk,
			"STORED" => Stored,
			"GETCHUNK" => Getchunk,
			"CHUNK" => Chunk,
			"DELETE" => Delete,
			"REMOVED" => Removed,
			"FILECHECK" => Filecheck,
			"LOOKUP" => Lookup,
			"NODE" => Node,
			"REDIRECT" => Redirect,
			"GETPREDECESSOR" => GetPredecessor,
			"GETSUCCESSOR" => GetSuccessor,
			"NOTIFY" => Notify,
			"PROCESSEDYES" => ProcessedYes,
			"PROCESSEDNO" => ProcessedNo,
			"PUTFILE" => Putfile,
			"DATA" => Data,
			"GETFILE" => Getfile,
			"REMOVEPOINTER" => RemovePointer,
			_ => return Err(ParseError::UnknownMessageType(s.to_string()))
		})
	}
}

impl fmt::Display for MessageType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A protocol message.
/// Only the fields of its type are present,
/// use `MessageFactory` to build one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	pub version: ProtocolVersion,
	pub kind: MessageType,
	pub sender_id: Digest,
	file_id: Option<FileId>,
	key: Option<Digest>,
	chunk_no: Option<u32>,
	replication_degree: Option<u32>,
	perceived_degree: Option<u32>,
	parts: Option<u32>,
	byte_amount: Option<u64>,
	node: Option<ChordNode>,
	body: Option<Vec<u8>>
}

fn next_token<'a>(tokens: &mut SplitAsciiWhitespace<'a>, field: &'static str) -> Result<&'a str, ParseError> {
	tokens.next().ok_or(ParseError::MissingField(field))
}

fn parse_token<T: FromStr>(tokens: &mut SplitAsciiWhitespace, field: &'static str) -> Result<T, ParseError> {
	let token = next_token(tokens, field)?;
	token.parse().map_err(|_| ParseError::InvalidField {
		field,
		value: token.to_string()
	})
}

fn parse_node(tokens: &mut SplitAsciiWhitespace, optional: bool) -> Result<Option<ChordNode>, ParseError> {
	let addr = next_token(tokens, "node address")?;
	if optional && addr == NULL_NODE {
		return Ok(None);
	}
	let id = parse_token(tokens, "node id")?;
	Ok(Some(ChordNode {
		id,
		addr: addr.to_string()
	}))
}

impl Message {
	fn empty(version: ProtocolVersion, kind: MessageType, sender_id: Digest) -> Self {
		Self {
			version,
			kind,
			sender_id,
			file_id: None,
			key: None,
			chunk_no: None,
			replication_degree: None,
			perceived_degree: None,
			parts: None,
			byte_amount: None,
			node: None,
			body: None
		}
	}

	pub fn file_id(&self) -> Result<&str, ParseError> {
		self.file_id.as_deref().ok_or(ParseError::FieldNotPresent("file id"))
	}

	pub fn key(&self) -> Result<Digest, ParseError> {
		self.key.ok_or(ParseError::FieldNotPresent("key"))
	}

	pub fn chunk_no(&self) -> Result<u32, ParseError> {
		self.chunk_no.ok_or(ParseError::FieldNotPresent("chunk number"))
	}

	pub fn replication_degree(&self) -> Result<u32, ParseError> {
		self.replication_degree.ok_or(ParseError::FieldNotPresent("replication degree"))
	}

	pub fn perceived_degree(&self) -> Result<u32, ParseError> {
		self.perceived_degree.ok_or(ParseError::FieldNotPresent("perceived degree"))
	}

	pub fn parts(&self) -> Result<u32, ParseError> {
		self.parts.ok_or(ParseError::FieldNotPresent("parts"))
	}

	pub fn byte_amount(&self) -> Result<u64, ParseError> {
		self.byte_amount.ok_or(ParseError::FieldNotPresent("byte amount"))
	}

	pub fn node(&self) -> Result<&ChordNode, ParseError> {
		self.node.as_ref().ok_or(ParseError::FieldNotPresent("node"))
	}

	// NODE replies may legitimately carry no node
	pub fn maybe_node(&self) -> Option<&ChordNode> {
		self.node.as_ref()
	}

	pub fn body(&self) -> Result<&[u8], ParseError> {
		self.body.as_deref().ok_or(ParseError::FieldNotPresent("body"))
	}

	pub fn into_body(self) -> Result<Vec<u8>, ParseError> {
		self.body.ok_or(ParseError::FieldNotPresent("body"))
	}

	/// Composite key of the chunk this message is about
	pub fn chunk_key(&self) -> Result<String, ParseError> {
		Ok(super::chunk_key(self.file_id()?, self.chunk_no()?))
	}

	fn header_tokens(&self) -> Vec<String> {
		let mut tokens = vec![
			self.version.to_string(),
			self.kind.to_string(),
			self.sender_id.to_string()
		];
		for field in self.kind.fields() {
			match field {
				Field::FileId => tokens.extend(self.file_id.clone()),
				Field::Key => tokens.extend(self.key.map(|k| k.to_string())),
				Field::ChunkNo => tokens.extend(self.chunk_no.map(|n| n.to_string())),
				Field::ReplicationDegree => tokens.extend(self.replication_degree.map(|d| d.to_string())),
				Field::PerceivedDegree => tokens.extend(self.perceived_degree.map(|d| d.to_string())),
				Field::Parts => tokens.extend(self.parts.map(|p| p.to_string())),
				Field::ByteAmount => tokens.extend(self.byte_amount.map(|b| b.to_string())),
				Field::Node | Field::OptionalNode => match &self.node {
					Some(node) => {
						tokens.push(node.addr.clone());
						tokens.push(node.id.to_string());
					},
					None => tokens.push(NULL_NODE.to_string())
				}
			}
		}
		tokens
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut data = self.header_tokens().join(" ").into_bytes();
		data.push(b' ');
		data.extend_from_slice(SENTINEL);
		if let Some(body) = &self.body {
			data.extend_from_slice(body);
		}
		data
	}

	pub fn decode(data: &[u8]) -> Result<Message, ParseError> {
		let end = data.windows(SENTINEL.len())
			.position(|w| w == SENTINEL)
			.ok_or(ParseError::MissingSentinel)?;
		let header = std::str::from_utf8(&data[..end]).map_err(|_| ParseError::InvalidHeader)?;
		let mut tokens = header.split_ascii_whitespace();

		let version = next_token(&mut tokens, "version")?.parse()?;
		let kind: MessageType = next_token(&mut tokens, "type")?.parse()?;
		let sender_id = parse_token(&mut tokens, "sender id")?;
		let mut message = Message::empty(version, kind, sender_id);

		for field in kind.fields() {
			match field {
				Field::FileId => {
					let file_id = next_token(&mut tokens, "file id")?;
					if !is_valid_file_id(file_id) {
						return Err(ParseError::InvalidField {
							field: "file id",
							value: file_id.to_string()
						});
					}
					message.file_id = Some(file_id.to_string());
				},
				Field::Key => message.key = Some(parse_token(&mut tokens, "key")?),
				Field::ChunkNo => {
					let chunk_no: u32 = parse_token(&mut tokens, "chunk number")?;
					if chunk_no > MAX_CHUNK_NO {
						return Err(ParseError::InvalidField {
							field: "chunk number",
							value: chunk_no.to_string()
						});
					}
					message.chunk_no = Some(chunk_no);
				},
				Field::ReplicationDegree => message.replication_degree = Some(parse_token(&mut tokens, "replication degree")?),
				Field::PerceivedDegree => message.perceived_degree = Some(parse_token(&mut tokens, "perceived degree")?),
				Field::Parts => message.parts = Some(parse_token(&mut tokens, "parts")?),
				Field::ByteAmount => message.byte_amount = Some(parse_token(&mut tokens, "byte amount")?),
				Field::Node => message.node = parse_node(&mut tokens, false)?,
				Field::OptionalNode => message.node = parse_node(&mut tokens, true)?
			}
		}

		if kind.has_body() {
			message.body = Some(data[end + SENTINEL.len()..].to_vec());
		}
		Ok(message)
	}
}

impl fmt::Display for Message {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.header_tokens().join(" "))?;
		if let Some(body) = &self.body {
			write!(f, " (body={}B)", body.len())?;
		}
		Ok(())
	}
}

/// Builds the messages sent by one peer
#[derive(Debug, Clone)]
pub struct MessageFactory {
	pub version: ProtocolVersion,
	pub sender_id: Digest
}

impl MessageFactory {
	pub fn new(version: ProtocolVersion, sender_id: Digest) -> Self {
		Self {
			version,
			sender_id
		}
	}

	pub fn with_version(&self, version: ProtocolVersion) -> Self {
		Self {
			version,
			sender_id: self.sender_id
		}
	}

	fn message(&self, kind: MessageType) -> Message {
		Message::empty(self.version, kind, self.sender_id)
	}

	fn chunk_message(&self, kind: MessageType, file_id: &str, chunk_no: u32) -> Message {
		let mut m = self.message(kind);
		m.file_id = Some(file_id.to_string());
		m.chunk_no = Some(chunk_no);
		m
	}

	fn file_message(&self, kind: MessageType, file_id: &str) -> Message {
		let mut m = self.message(kind);
		m.file_id = Some(file_id.to_string());
		m
	}

	pub fn putchunk(&self, file_id: &str, chunk_no: u32, replication_degree: u32, body: Vec<u8>) -> Message {
		let mut m = self.chunk_message(MessageType::Putchunk, file_id, chunk_no);
		m.replication_degree = Some(replication_degree);
		m.body = Some(body);
		m
	}

	pub fn stored(&self, file_id: &str, chunk_no: u32) -> Message {
		self.chunk_message(MessageType::Stored, file_id, chunk_no)
	}

	pub fn getchunk(&self, file_id: &str, chunk_no: u32) -> Message {
		self.chunk_message(MessageType::Getchunk, file_id, chunk_no)
	}

	pub fn chunk(&self, file_id: &str, chunk_no: u32, body: Vec<u8>) -> Message {
		let mut m = self.chunk_message(MessageType::Chunk, file_id, chunk_no);
		m.body = Some(body);
		m
	}

	pub fn removed(&self, file_id: &str, chunk_no: u32) -> Message {
		self.chunk_message(MessageType::Removed, file_id, chunk_no)
	}

	pub fn delete(&self, file_id: &str) -> Message {
		self.file_message(MessageType::Delete, file_id)
	}

	pub fn filecheck(&self, file_id: &str) -> Message {
		self.file_message(MessageType::Filecheck, file_id)
	}

	pub fn remove_pointer(&self, file_id: &str) -> Message {
		self.file_message(MessageType::RemovePointer, file_id)
	}

	pub fn lookup(&self, key: Digest) -> Message {
		let mut m = self.message(MessageType::Lookup);
		m.key = Some(key);
		m
	}

	pub fn node(&self, node: Option<ChordNode>) -> Message {
		let mut m = self.message(MessageType::Node);
		m.node = node;
		m
	}

	pub fn redirect(&self, node: ChordNode) -> Message {
		let mut m = self.message(MessageType::Redirect);
		m.node = Some(node);
		m
	}

	pub fn notify(&self, node: ChordNode) -> Message {
		let mut m = self.message(MessageType::Notify);
		m.node = Some(node);
		m
	}

	pub fn get_predecessor(&self) -> Message {
		self.message(MessageType::GetPredecessor)
	}

	pub fn get_successor(&self) -> Message {
		self.message(MessageType::GetSuccessor)
	}

	pub fn processed(&self, yes: bool) -> Message {
		self.message(if yes { MessageType::ProcessedYes } else { MessageType::ProcessedNo })
	}

	pub fn putfile(&self, file_id: &str, parts: u32, replication_degree: u32, perceived_degree: u32, byte_amount: u64) -> Message {
		let mut m = self.file_message(MessageType::Putfile, file_id);
		m.parts = Some(parts);
		m.replication_degree = Some(replication_degree);
		m.perceived_degree = Some(perceived_degree);
		m.byte_amount = Some(byte_amount);
		m
	}

	pub fn data(&self, file_id: &str, order: u32, body: Vec<u8>) -> Message {
		let mut m = self.chunk_message(MessageType::Data, file_id, order);
		m.body = Some(body);
		m
	}

	pub fn getfile(&self, file_id: &str, requester: ChordNode) -> Message {
		let mut m = self.file_message(MessageType::Getfile, file_id);
		m.node = Some(requester);
		m
	}
}
