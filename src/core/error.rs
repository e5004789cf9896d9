use thiserror::Error;
use std::result::Result;
use super::{
	ring::{ChordNode, Digest},
	message::{MessageType, ParseError}
};

#[derive(Error, Debug)]
pub enum BackupError {
	#[error("No reply from {0}")]
	NoReply(ChordNode),
	#[error("Unexpected reply {0}")]
	UnexpectedReply(MessageType),
	#[error("Lookup of key {0} went around in circles")]
	LookupLoop(Digest),
	#[error("Routing of key {0} exhausted its attempts")]
	RoutingExhausted(Digest),
	#[error("Failed to join via {node}: {message}")]
	JoinFailure {
		node: ChordNode,
		message: String
	},
	#[error("File {0} needs more chunks than allowed")]
	TooManyChunks(String),
	#[error("Chunk {chunk_no} of file {file_id} was not stored by any peer")]
	Unrecoverable {
		file_id: String,
		chunk_no: u32
	},
	#[error("Missing chunks {0:?}")]
	MissingChunks(Vec<u32>),
	#[error("Message error: {0}")]
	MessageError(#[from] ParseError),
	#[error("RPC error: {0}")]
	RpcError(#[from] tarpc::client::RpcError),
	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
	#[error("State serialization error: {0}")]
	StateError(#[from] serde_json::Error),
	#[error("Failed to signal shutdown")]
	ShutdownError(#[from] tokio::sync::watch::error::SendError<bool>),
	#[error("Task error: {0}")]
	TaskError(#[from] tokio::task::JoinError)
}

pub type BackupResult<T> = Result<T, BackupError>;
