//! Peril game client

use clap::Parser;

#[tokio::main]
async fn main() {
    let args = peril::Args::parse();
    if let Err(e) = peril::client::run(args).await {
        eprintln!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}
