use clap::Parser;
use stacktach::{config::DEFAULT_CONFIG_PATH, supervisor::Role, telemetry};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "stacktach", about = "OpenStack notification ingest and usage verification")]
struct Cli {
    /// Path to the verifier configuration file
    #[arg(short, long, env = "STACKTACH_VERIFIER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Which components to run
    #[arg(long, value_enum, default_value_t = Role::All)]
    role: Role,

    /// Create missing tables before starting
    #[arg(long)]
    init_schema: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();
    stacktach::run(&cli.config, cli.role, cli.init_schema).await
}
