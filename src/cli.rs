use std::path::PathBuf;

use bc_identity::Protocol;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "broadcast-dm",
    about = "Multi-protocol message redundancy engine: one send, five transports",
    version,
    long_about = None,
)]
pub struct Cli {
    /// Comma-separated transports to bring up for this run (xmtp,nostr,mqtt,waku,iroh).
    /// Defaults to every transport the loaded configuration enables.
    #[arg(long, value_delimiter = ',', value_parser = parse_protocol)]
    pub protocols: Vec<Protocol>,

    /// Display label for this run's identity. Has no effect on key material —
    /// identity persistence is a profile-store collaborator's concern.
    #[arg(long, default_value = "anonymous")]
    pub user: String,

    /// Recipient magnet link. When given, sends one message and exits instead
    /// of listening.
    #[arg(long)]
    pub chat: Option<String>,

    /// Path to a config file (overrides auto-discovery).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_protocol(s: &str) -> Result<Protocol, String> {
    s.parse()
}
