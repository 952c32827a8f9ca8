use std::sync::Arc;

use clap::Parser;

use usftp::config::ServerConfig;
use usftp::server::Server;
use usftp::store::UserStore;

/// Minimal multi-session FTP server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// Path to the INI configuration file
  #[arg(long, default_value_t = String::from("ftpserver.conf"))]
  config: String,

  /// Path to the JSON user store
  #[arg(long, default_value_t = String::from("users.json"))]
  users: String,
}

async fn run(args: Args) -> usftp::error::Result<()> {
  let config = ServerConfig::load(&args.config)?;
  let store = Arc::new(UserStore::open(&args.users)?);
  let server = Server::new(config, store)?;
  server
    .listen(async {
      tokio::signal::ctrl_c().await.ok();
    })
    .await
}

#[tokio::main]
async fn main() {
  env_logger::init();
  let args = Args::parse();
  if let Err(e) = run(args).await {
    eprintln!("usftpd: {}", e);
    std::process::exit(1);
  }
}
