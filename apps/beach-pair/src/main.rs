use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use beach_pair::config::{
    DEFAULT_CHANNEL_LABEL, DEFAULT_RELAY_URL, PairingConfig, default_ice_servers,
};
use beach_pair::peer::RtcEngineFactory;
use beach_pair::relay::WsRelay;
use beach_pair::session::{self, DisconnectCause, PairingError, PairingHandle, SessionEvent};
use beach_pair::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use clap::{Args, Parser, Subcommand};
use pair_proto::RoomId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

const QUIT_COMMAND: &str = "/quit";

#[derive(Parser, Debug)]
#[command(
    name = "beach-pair",
    about = "Pair with a partner through a relay and chat over a WebRTC data channel",
    author,
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "BEACH_PAIR_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "BEACH_PAIR_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a room and chat with whoever the relay pairs you with
    Pair(PairArgs),
}

#[derive(Args, Debug)]
struct PairArgs {
    #[arg(value_name = "ROOM_ID", help = "Room to join (5-15 characters)")]
    room_id: String,

    #[arg(
        long,
        env = "BEACH_PAIR_RELAY_URL",
        default_value = DEFAULT_RELAY_URL,
        help = "Relay websocket endpoint"
    )]
    relay_url: String,

    #[arg(
        long,
        env = "BEACH_PAIR_CLIENT_ID",
        help = "Client id announced to the relay (defaults to the platform name)"
    )]
    client_id: Option<String>,

    #[arg(
        long,
        env = "BEACH_PAIR_CHANNEL_LABEL",
        default_value = DEFAULT_CHANNEL_LABEL,
        help = "Label of the data channel opened by the master"
    )]
    channel_label: String,

    #[arg(
        long = "reconnect-delay-ms",
        env = "BEACH_PAIR_RECONNECT_DELAY_MS",
        default_value_t = 3000,
        help = "Delay before redialing a dropped relay"
    )]
    reconnect_delay_ms: u64,

    #[arg(
        long = "ice-server",
        value_name = "URL",
        env = "BEACH_PAIR_ICE_SERVERS",
        value_delimiter = ',',
        help = "ICE server URL; repeat or comma-separate (defaults to a public STUN server)"
    )]
    ice_servers: Vec<String>,
}

impl PairArgs {
    fn to_config(&self) -> PairingConfig {
        let defaults = PairingConfig::default();
        PairingConfig {
            relay_url: self.relay_url.clone(),
            client_id: self.client_id.clone().unwrap_or(defaults.client_id),
            channel_label: self.channel_label.clone(),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            ice_servers: if self.ice_servers.is_empty() {
                default_ice_servers()
            } else {
                self.ice_servers.clone()
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logctl::init(&cli.logging.to_config()) {
        eprintln!("❌ {err}");
        return ExitCode::from(1);
    }
    match cli.command {
        Command::Pair(args) => {
            if let Err(err) = RoomId::parse(&args.room_id) {
                eprintln!("❌ {err}");
                return ExitCode::from(2);
            }
            match run_pair(args).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("❌ {err:#}");
                    ExitCode::from(1)
                }
            }
        }
    }
}

async fn run_pair(args: PairArgs) -> Result<()> {
    let config = args.to_config();
    debug!(config = ?config, "starting pairing client");
    let engines = Arc::new(RtcEngineFactory::from_config(&config));
    let (handle, mut events) = session::spawn(config, Box::new(WsRelay::new()), engines)
        .context("invalid relay configuration")?;
    handle
        .request_pairing(&args.room_id)
        .await
        .context("pairing request rejected")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{event}");
                if is_terminal(&event) {
                    break;
                }
            }
            line = lines.next_line() => {
                let line = line.context("failed to read stdin")?;
                match line.as_deref().map(str::trim) {
                    None | Some(QUIT_COMMAND) => {
                        handle.disconnect().await.context("disconnect failed")?;
                        drain(&mut events);
                        break;
                    }
                    Some("") => {}
                    Some(text) => send_line(&handle, text).await?,
                }
            }
        }
    }
    handle.shutdown().await.ok();
    Ok(())
}

async fn send_line(handle: &PairingHandle, text: &str) -> Result<()> {
    match handle.send_message(text).await {
        Ok(()) => Ok(()),
        Err(PairingError::ChannelNotOpen) => {
            println!("data channel not open yet; message not sent");
            Ok(())
        }
        Err(err) => Err(err).context("send failed"),
    }
}

fn is_terminal(event: &SessionEvent) -> bool {
    matches!(
        event,
        SessionEvent::Disconnected {
            cause: DisconnectCause::RoomFull
        }
    )
}

fn drain(events: &mut UnboundedReceiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        println!("{event}");
    }
}
