use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "guildvote-server", about = "Poll store and message reconciliation service")]
pub struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "guildvote.toml")]
    pub config: String,

    /// Guild to treat as reachable from startup (repeatable)
    #[arg(long = "guild", value_name = "GUILD_ID")]
    pub guilds: Vec<i64>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}
