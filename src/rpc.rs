use crate::core::{
	ring::Digest,
	protocol::OpResult
};

#[tarpc::service]
pub trait PeerService {
	// Deliver an encoded ring message, returning the encoded reply if any
	async fn deliver_rpc(frame: Vec<u8>) -> Option<Vec<u8>>;
	async fn ping_rpc() -> Digest;

	// Client operations
	async fn backup_rpc(path: String, replication_degree: u32) -> OpResult;
	async fn restore_rpc(file_name: String) -> OpResult;
	async fn delete_rpc(file_name: String) -> OpResult;
	async fn reclaim_rpc(max_storage: i64) -> OpResult;
	async fn status_rpc() -> String;
}
