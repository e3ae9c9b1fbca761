use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use runnel::server::Server;
use runnel_greet::server::{GreetService, GreeterServer, ReductionPolicy};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Serves greet.GreetService over TCP.
#[derive(Parser, Debug)]
#[command(name = "greet-server")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:50051")]
    addr: SocketAddr,

    /// Greetings sent by GreetManyTimes
    #[arg(long, default_value_t = 10)]
    greet_count: usize,

    /// Pause between two GreetManyTimes greetings, in milliseconds
    #[arg(long)]
    stream_delay_ms: Option<u64>,

    /// When FindMaximum reports: every-input, on-change or final
    #[arg(long, default_value_t = ReductionPolicy::EveryInput)]
    reduction: ReductionPolicy,

    /// Deadline applied to every call, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let greeter = GreetService::new()
        .greet_count(args.greet_count)
        .stream_delay(args.stream_delay_ms.map(Duration::from_millis))
        .reduction(args.reduction);

    let mut server = Server::builder();
    if let Some(ms) = args.timeout_ms {
        server = server.timeout(Duration::from_millis(ms));
    }

    info!(addr = %args.addr, ?greeter, "GreetService starting");

    server
        .add_service(GreeterServer::new(greeter))
        .serve_with_shutdown(args.addr, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
