use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "server-tracker",
    version,
    about = "Track server slot ownership from a line console on stdin"
)]
struct Cli {
    /// Config file (default: <config_dir>/server-tracker/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = server_tracker_lib::run(cli.config).await {
        eprintln!("server-tracker: {e}");
        std::process::exit(1);
    }
}
