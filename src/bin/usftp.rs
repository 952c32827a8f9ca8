use clap::Parser;

use usftp::client::cli::{run, Cli};

#[tokio::main(flavor = "current_thread")]
async fn main() {
  env_logger::init();
  let cli = Cli::parse();
  std::process::exit(run(cli).await);
}
