use clap::Parser;
use storage_gateway::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logging is not up yet if configuration fails to load
    if let Err(e) = storage_gateway::run_server(cli).await {
        eprintln!("storage-gateway: {:#}", e);
        std::process::exit(1);
    }
}
