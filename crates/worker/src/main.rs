use std::process;

use jobrelay_worker::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::init();
    jobrelay_observability::init_with(&cli.log.to_config());

    tracing::info!(version = env!("CARGO_PKG_VERSION"), backend = %cli.queue.backend, "starting jobrelay worker");

    let Err(error) = jobrelay_worker::run(cli).await else {
        process::exit(0);
    };

    tracing::error!(error = %format!("{error:#}"), "worker terminated with error");
    eprintln!("Error: {error:#}");
    process::exit(1);
}
