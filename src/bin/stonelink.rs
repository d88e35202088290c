use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::runtime;
use tracing::{info, warn};

use stonelink::exchange::GENERIC;
use stonelink::{
    setup_local_tracing, verbosity_level, AppResult, Exchanger, Node, ResponseChannel,
    TransportAddress, TransportConfig, TransportRequestOptions,
};

/// Action served by `serve` and called by `ping`.
const ECHO_ACTION: &str = "stonelink:echo";

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Bind the configured address and answer echo requests
    Serve,
    /// Connect to a peer, handshake and send one echo request
    Ping {
        /// peer address, host:port
        #[arg(long)]
        peer: String,
        #[arg(long, default_value = "ping")]
        message: String,
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
    PrintConfig,
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    setup_local_tracing(verbosity_level(commandline.verbose))?;

    let config = load_config(commandline.conf.as_deref())?;
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    match commandline.command.unwrap_or(Command::Serve) {
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
        Command::Serve => rt.block_on(serve(config)),
        Command::Ping {
            peer,
            message,
            timeout_ms,
        } => rt.block_on(ping(
            config,
            &peer,
            message,
            Duration::from_millis(timeout_ms),
        )),
    }
}

/// An explicit `--conf` must exist, otherwise `./conf.toml` is used when present.
fn load_config(conf: Option<&str>) -> AppResult<TransportConfig> {
    if let Some(path) = conf {
        return TransportConfig::set_up_config(PathBuf::from(path));
    }
    let default_path = PathBuf::from("./conf.toml");
    if default_path.exists() {
        return TransportConfig::set_up_config(default_path);
    }
    warn!("no conf.toml found, running with defaults");
    Ok(TransportConfig::default())
}

async fn serve(config: TransportConfig) -> AppResult<()> {
    let exchanger = Exchanger::new(config)?;
    exchanger.register_request_handler::<String, _>(
        ECHO_ACTION,
        GENERIC,
        |request: String, channel: ResponseChannel| async move { channel.send_response(&request) },
    )?;
    let address = exchanger.start().await?;
    info!(%address, "serving {}, ctrl-c to stop", ECHO_ACTION);

    tokio::signal::ctrl_c().await?;
    info!("received ctrl-c, shutting down");
    exchanger.stop();
    Ok(())
}

async fn ping(
    config: TransportConfig,
    peer: &str,
    message: String,
    timeout: Duration,
) -> AppResult<()> {
    let node = Node::new(TransportAddress::lookup_str(peer).await?);
    let exchanger = Exchanger::new(config)?;

    let started = Instant::now();
    exchanger.connect_to_node(&node, None).await?;
    let connected_in = started.elapsed();

    let options = TransportRequestOptions::default().with_timeout(timeout);
    let sent_at = Instant::now();
    let reply: String = exchanger
        .submit_request(&node, ECHO_ACTION, &message, &options)
        .await?;
    println!(
        "{} answered {:?}, connect {:?}, round trip {:?}",
        node,
        reply,
        connected_in,
        sent_at.elapsed()
    );
    exchanger.stop();
    Ok(())
}
