use crate::core::error::*;
use futures::future;

/// Handle on the tasks of a running peer
pub struct ServerManager {
	pub handle: future::JoinAll<tokio::task::JoinHandle<()>>,
	pub tx: tokio::sync::watch::Sender<bool>
}

impl ServerManager {
	/// Wait for the peer to terminate
	pub async fn wait(self) -> BackupResult<()> {
		self.handle.await
			.into_iter()
			.collect::<Result<Vec<_>, tokio::task::JoinError>>()?;

		Ok(())
	}

	/// Stop the listeners and periodic tasks gracefully
	pub async fn stop(self) -> BackupResult<()> {
		self.tx.send(true)?;
		self.wait().await
	}
}
