use std::time::Duration;
use log::info;
use tokio::time::sleep;
use crate::core::{
	peer::Peer,
	channel::ChannelKind
};
use super::OpResult;

// DELETE is repeated since broadcasts may be lost
const DELETE_ROUNDS: u32 = 5;
const DELETE_INTERVAL: Duration = Duration::from_millis(500);

impl Peer {
	/// Delete a backed up file from the network
	pub async fn delete(&self, file_name: &str) -> OpResult {
		match self.state.file_by_name(file_name) {
			Some(info) => {
				self.delete_file(&info.file_id).await;
				OpResult::ok(format!("File {} deleted", file_name))
			},
			None => OpResult::failed(format!("File {} was never backed up by this peer", file_name))
		}
	}

	pub(crate) async fn delete_file(&self, file_id: &str) {
		self.state.add_deleted(file_id);
		self.state.remove_file(file_id);
		self.purge_file(file_id);

		let message = self.factory.delete(file_id);
		for round in 0..DELETE_ROUNDS {
			if round > 0 {
				sleep(DELETE_INTERVAL).await;
			}
			self.broadcast(ChannelKind::Control, &message).await;
		}
		info!("{}: deleted file {}", self.node(), file_id);
	}
}
