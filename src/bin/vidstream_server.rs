use clap::Parser;
use clap_derive::Parser;
use tracing::Level;
use vidstream::config::ServerConfig;
use vidstream::server::StreamServer;

#[derive(Parser)]
struct Args {
    /// UDP address for control commands, e.g. 0.0.0.0:8000
    bind_address: String,

    /// directory containing the videos that can be requested
    #[clap(long, default_value = "video_source")]
    media_root: String,

    #[clap(long, default_value_t = 24.0)]
    frame_rate: f64,

    /// bytes per frame
    #[clap(long, default_value_t = 4096)]
    chunk_size: usize,

    #[clap(long, default_value_t = 16)]
    max_sessions: usize,

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

    let mut config = ServerConfig::new(args.bind_address.parse()?);
    config.media_root = args.media_root.into();
    config.frame_rate = args.frame_rate;
    config.chunk_size = args.chunk_size;
    config.max_sessions = args.max_sessions;

    let server = StreamServer::bind(config).await?;
    server.recv_loop().await
}
