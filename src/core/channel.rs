use std::{
	io,
	net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
	sync::Arc
};
use futures::{
	future::{self, BoxFuture},
	stream::{self, BoxStream},
	FutureExt,
	StreamExt
};
use log::warn;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::UdpSocket, sync::broadcast};

// largest UDP payload
const MAX_DATAGRAM: usize = 65507;

/// Unreliable group channel, delivering every message to all subscribers
pub trait Broadcast: Send + Sync {
	fn send(&self, data: Vec<u8>) -> BoxFuture<'static, io::Result<()>>;
	/// Messages together with the address of their sender
	fn subscribe(&self) -> BoxStream<'static, (Vec<u8>, IpAddr)>;
}

/// The three broadcast groups of the replication protocol
#[derive(Clone)]
pub struct Channels {
	pub control: Arc<dyn Broadcast>,
	pub backup: Arc<dyn Broadcast>,
	pub restore: Arc<dyn Broadcast>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
	Control,
	Backup,
	Restore
}

impl std::fmt::Display for ChannelKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			ChannelKind::Control => "control",
			ChannelKind::Backup => "backup",
			ChannelKind::Restore => "restore"
		};
		f.write_str(name)
	}
}

impl Channels {
	pub fn get(&self, kind: ChannelKind) -> &Arc<dyn Broadcast> {
		match kind {
			ChannelKind::Control => &self.control,
			ChannelKind::Backup => &self.backup,
			ChannelKind::Restore => &self.restore
		}
	}

	/// Join the three UDP multicast groups
	pub fn multicast(control: SocketAddrV4, backup: SocketAddrV4, restore: SocketAddrV4) -> io::Result<Self> {
		Ok(Self {
			control: Arc::new(MulticastChannel::join(control)?),
			backup: Arc::new(MulticastChannel::join(backup)?),
			restore: Arc::new(MulticastChannel::join(restore)?)
		})
	}
}

pub struct MulticastChannel {
	socket: Arc<UdpSocket>,
	group: SocketAddrV4
}

impl MulticastChannel {
	/// Must be called within a tokio runtime
	pub fn join(group: SocketAddrV4) -> io::Result<Self> {
		let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
		// several peers may listen on one host
		socket.set_reuse_address(true)?;
		socket.set_nonblocking(true)?;
		let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port()));
		socket.bind(&bind_addr.into())?;
		socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
		socket.set_multicast_loop_v4(true)?;
		let socket = UdpSocket::from_std(socket.into())?;
		Ok(Self {
			socket: Arc::new(socket),
			group
		})
	}
}

impl Broadcast for MulticastChannel {
	fn send(&self, data: Vec<u8>) -> BoxFuture<'static, io::Result<()>> {
		let socket = self.socket.clone();
		let group = self.group;
		async move {
			socket.send_to(&data, group).await?;
			Ok(())
		}.boxed()
	}

	fn subscribe(&self) -> BoxStream<'static, (Vec<u8>, IpAddr)> {
		stream::unfold(self.socket.clone(), |socket| async move {
			let mut buf = vec![0u8; MAX_DATAGRAM];
			loop {
				match socket.recv_from(&mut buf).await {
					Ok((len, addr)) => {
						buf.truncate(len);
						return Some(((buf, addr.ip()), socket));
					},
					Err(e) => warn!("Failed to receive datagram: {}", e)
				}
			}
		}).boxed()
	}
}

/// In-process broadcast group, one per channel kind.
/// Lets several peers share a host without multicast.
#[derive(Clone)]
pub struct LocalGroup {
	tx: broadcast::Sender<(Vec<u8>, IpAddr)>
}

impl LocalGroup {
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity);
		Self { tx }
	}

	pub fn join(&self, addr: IpAddr) -> LocalChannel {
		LocalChannel {
			tx: self.tx.clone(),
			addr
		}
	}
}

pub struct LocalChannel {
	tx: broadcast::Sender<(Vec<u8>, IpAddr)>,
	addr: IpAddr
}

impl Broadcast for LocalChannel {
	fn send(&self, data: Vec<u8>) -> BoxFuture<'static, io::Result<()>> {
		// nobody listening is not an error for a datagram
		let _ = self.tx.send((data, self.addr));
		future::ready(Ok(())).boxed()
	}

	fn subscribe(&self) -> BoxStream<'static, (Vec<u8>, IpAddr)> {
		stream::unfold(self.tx.subscribe(), |mut rx| async move {
			loop {
				match rx.recv().await {
					Ok(item) => return Some((item, rx)),
					Err(broadcast::error::RecvError::Lagged(n)) => warn!("Dropped {} lagging messages", n),
					Err(broadcast::error::RecvError::Closed) => return None
				}
			}
		}).boxed()
	}
}

/// Local groups for the three channels
#[derive(Clone)]
pub struct LocalNetwork {
	control: LocalGroup,
	backup: LocalGroup,
	restore: LocalGroup
}

impl LocalNetwork {
	pub fn new() -> Self {
		Self {
			control: LocalGroup::new(1024),
			backup: LocalGroup::new(1024),
			restore: LocalGroup::new(1024)
		}
	}

	pub fn join(&self, addr: IpAddr) -> Channels {
		Channels {
			control: Arc::new(self.control.join(addr)),
			backup: Arc::new(self.backup.join(addr)),
			restore: Arc::new(self.restore.join(addr))
		}
	}
}

impl Default for LocalNetwork {
	fn default() -> Self {
		Self::new()
	}
}
