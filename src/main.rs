use tracing::{error, info};

mod browser;
mod cli;
mod crawler;
mod storage;
mod utils;

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args = cli::parse_args();

    // Initialize logging
    if let Err(e) = utils::init_logging(args.verbose, args.log_file.clone()) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    info!("Starting l1scan v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(code) => {
            if code == 0 {
                info!("Command completed successfully");
            }
            std::process::exit(code);
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
