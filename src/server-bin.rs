use std::{net::SocketAddrV4, path::PathBuf};
use chord_backup::core::{
	self,
	channel::Channels,
	message::ProtocolVersion,
	Config,
	ChordNode,
	Peer
};
use clap::Parser;
use log::info;

#[derive(Parser)]
struct Args {
	/// Local addr to bind (<host>:<port>)
	addr: String,

	/// Join an existing peer on init (<host>:<port>)
	#[clap(short, long)]
	join: Option<String>,

	/// Protocol version (1.0 vanilla, 1.1 enhanced)
	#[clap(short, long, default_value = "1.0")]
	version: ProtocolVersion,

	/// Directory for chunks, restored files and state
	#[clap(short, long)]
	root_dir: Option<PathBuf>,

	/// Control channel group (<ip>:<port>)
	#[clap(long, default_value = "230.0.0.1:4445")]
	mc: SocketAddrV4,

	/// Backup channel group (<ip>:<port>)
	#[clap(long, default_value = "230.0.0.2:4446")]
	mdb: SocketAddrV4,

	/// Restore channel group (<ip>:<port>)
	#[clap(long, default_value = "230.0.0.3:4447")]
	mdr: SocketAddrV4
}


#[tokio::main]
async fn main() -> anyhow::Result<()> {
	env_logger::init();
	let args = Args::parse();

	let node = core::construct_node(&args.addr);
	let join_node: Option<ChordNode> = args.join.as_ref().map(|n| core::construct_node(n));

	let config = Config {
		version: args.version,
		root_dir: args.root_dir.unwrap_or_else(|| PathBuf::from(format!("peer-{}", node.id))),
		..Config::default()
	};
	let channels = Channels::multicast(args.mc, args.mdb, args.mdr)?;
	let peer = Peer::new(node, config, channels)?;
	let manager = peer.start(join_node).await?;

	tokio::select! {
		result = manager.handle => {
			result.into_iter().collect::<Result<Vec<_>, _>>()?;
		},
		_ = tokio::signal::ctrl_c() => {
			info!("{}: shutting down", peer.node());
			manager.tx.send(true)?;
		}
	}
	Ok(())
}
