use std::sync::Arc;

use clap::Parser;
use clap_derive::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, Level};
use vidstream::client::cli::{CliCommand, USAGE};
use vidstream::client::StreamClient;
use vidstream::config::ClientConfig;
use vidstream::error::StreamError;

#[derive(Parser)]
struct Args {
    /// the server's control address, e.g. 127.0.0.1:8000
    server_address: String,

    /// frames buffered before playback starts
    #[clap(long, default_value_t = 10)]
    prebuffer: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = ClientConfig::new(args.server_address.parse()?);
    config.prebuffer_frames = args.prebuffer;
    let client = Arc::new(StreamClient::connect(config).await?);

    println!("{}", USAGE);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match CliCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        match command {
            CliCommand::Play { video, port } => {
                // PLAY may take a while to retry, and STOP must still be accepted meanwhile
                let client = client.clone();
                tokio::spawn(async move {
                    match client.play(&video, port).await {
                        Ok(conn_id) => info!("playing {:?} as session {}", video, conn_id),
                        Err(e) => error!("PLAY failed: {}", e),
                    }
                });
            }
            CliCommand::Stop => match client.stop().await {
                Ok(snapshot) => println!("{}", snapshot),
                Err(StreamError::StoppedLocally { metrics, cause }) => {
                    error!("STOP was not acknowledged by the server: {}", cause);
                    println!("{}", metrics);
                }
                Err(e) => error!("STOP failed: {}", e),
            },
            CliCommand::Quit => break,
        }
    }

    client.quit().await;
    Ok(())
}
