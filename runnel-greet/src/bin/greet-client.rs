use std::time::Duration;

use clap::{Parser, Subcommand};
use runnel::client::Endpoint;
use runnel_greet::client::GreeterClient;
use runnel_greet::pb::{GreetRequest, Greeting, Numbers};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Calls greet.GreetService.
#[derive(Parser, Debug)]
#[command(name = "greet-client")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:50051")]
    addr: String,

    /// Deadline of each call, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Pause between two requests of a streaming call, in milliseconds
    #[arg(long)]
    pacing_ms: Option<u64>,

    #[command(subcommand)]
    call: Option<Call>,
}

#[derive(Subcommand, Debug)]
enum Call {
    /// Unary
    Greet {
        #[arg(long, default_value = "Nandakumar")]
        first: String,
        #[arg(long, default_value = "R")]
        last: String,
    },
    /// Server streaming
    GreetManyTimes {
        #[arg(long, default_value = "Nandakumar")]
        first: String,
        #[arg(long, default_value = "R")]
        last: String,
    },
    /// Client streaming
    LongGreet {
        #[arg(value_delimiter = ',', default_value = "nanda,nanda1,nanda2,nanda3")]
        names: Vec<String>,
    },
    /// Bidirectional streaming
    GreetEveryOne {
        #[arg(value_delimiter = ',', default_value = "nanda,nanda1,nanda2,nanda3")]
        names: Vec<String>,
    },
    /// Bidirectional streaming, running maximum
    FindMaximum {
        #[arg(value_delimiter = ',', default_value = "1,5,3,6,2,20")]
        numbers: Vec<i32>,
    },
}

fn requests(names: Vec<String>) -> impl tokio_stream::Stream<Item = GreetRequest> {
    tokio_stream::iter(
        names
            .into_iter()
            .map(|name| GreetRequest::from(Greeting::first(name))),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let channel = Endpoint::from_shared(args.addr).connect().await?;
    let mut client = GreeterClient::new(channel).pacing(args.pacing_ms.map(Duration::from_millis));
    if let Some(ms) = args.timeout_ms {
        client = client.timeout(Duration::from_millis(ms));
    }

    let call = args.call.unwrap_or(Call::Greet {
        first: "Nandakumar".into(),
        last: "R".into(),
    });

    match call {
        Call::Greet { first, last } => {
            let response = client.greet(Greeting::full(first, last).into()).await?;
            info!(result = %response.result, "Greet");
        }
        Call::GreetManyTimes { first, last } => {
            let mut stream = client
                .greet_many_times(Greeting::full(first, last).into())
                .await?;
            while let Some(response) = stream.message().await? {
                info!(result = %response.result, "GreetManyTimes");
            }
        }
        Call::LongGreet { names } => {
            let response = client.long_greet(requests(names)).await?;
            info!(result = %response.result, "LongGreet");
        }
        Call::GreetEveryOne { names } => {
            let summary = client
                .greet_every_one(requests(names), |response| {
                    info!(result = %response.result, "GreetEveryOne");
                })
                .await?;
            info!(sent = summary.sent, received = summary.received, "GreetEveryOne done");
        }
        Call::FindMaximum { numbers } => {
            let numbers = tokio_stream::iter(numbers.into_iter().map(Numbers::from));
            let summary = client
                .find_maximum(numbers, |max| {
                    info!(max = max.number, "FindMaximum");
                })
                .await?;
            info!(sent = summary.sent, received = summary.received, "FindMaximum done");
        }
    }

    Ok(())
}
