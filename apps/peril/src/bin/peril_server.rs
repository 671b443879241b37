//! Peril game server

#[tokio::main]
async fn main() {
    if let Err(e) = peril::server::run().await {
        eprintln!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}
