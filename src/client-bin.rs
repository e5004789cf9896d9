use std::time::{Duration, SystemTime};
use chord_backup::{
	client::setup_client,
	rpc::PeerServiceClient
};
use tarpc::context;
use clap::Parser;
use inquire::{Text, CustomUserError};
use anyhow::anyhow;

#[derive(Parser)]
struct Args {
	/// Peer addr to connect to (<host>:<port>)
	addr: String,
}

const COMMANDS: [&str; 5] = [
	"backup",
	"restore",
	"delete",
	"reclaim",
	"state"
];

// backups wait on several rounds of acknowledgements
const OPERATION_TIMEOUT: Duration = Duration::from_secs(300);

fn suggest_command(v: &str) -> Result<Vec<String>, CustomUserError> {
	let mut result = Vec::new();
	for command in COMMANDS {
		if v.len() > 0 && command.starts_with(v) {
			result.push(command.to_string());
		}
	}
	Ok(result)
}

fn complete_command(v: &str) -> Result<Option<String>, CustomUserError> {
	let result = suggest_command(v)?;
	let command = if result.len() > 0 {
		Some(result[0].clone() + " ")
	}
	else {
		None
	};
	Ok(command)
}

fn check_args(words: &[&str], expected: usize) -> anyhow::Result<()> {
	if words.len() != expected + 1 {
		return Err(anyhow!("{}: expected {} arguments", words[0], expected));
	}
	Ok(())
}

async fn execute_command(client: &PeerServiceClient, command: &str) -> anyhow::Result<()> {
	let words: Vec<_> = command.split_whitespace().collect();
	if words.len() == 0 {
		return Err(anyhow!("invalid command"));
	}

	let mut ctx = context::current();
	ctx.deadline = SystemTime::now() + OPERATION_TIMEOUT;
	let result = match words[0] {
		"backup" => {
			check_args(&words, 2)?;
			let degree: u32 = words[2].parse()?;
			let path = std::fs::canonicalize(words[1])?;
			client.backup_rpc(ctx, path.to_string_lossy().into_owned(), degree).await?
		},
		"restore" => {
			check_args(&words, 1)?;
			client.restore_rpc(ctx, words[1].to_string()).await?
		},
		"delete" => {
			check_args(&words, 1)?;
			client.delete_rpc(ctx, words[1].to_string()).await?
		},
		"reclaim" => {
			check_args(&words, 1)?;
			client.reclaim_rpc(ctx, words[1].parse()?).await?
		},
		"state" => {
			check_args(&words, 0)?;
			println!("{}", client.status_rpc(ctx).await?);
			return Ok(());
		},
		_ => {
			return Err(anyhow!("invalid command"));
		}
	};
	println!("{}", result);
	Ok(())
}


#[tokio::main]
async fn main() -> anyhow::Result<()> {
	env_logger::init();
	let args = Args::parse();
	let client = setup_client(&args.addr).await?;

	loop {
		let command = Text::new("")
			.with_suggester(&suggest_command)
			.with_completer(&complete_command)
			.prompt()?;

		match execute_command(&client, &command).await {
			Ok(_) => (),
			Err(e) => println!("Error: {}", e)
		};
	}
}
