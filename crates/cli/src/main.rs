use clap::{Parser, Subcommand};
use std::sync::Arc;
use wxgate::channels::{ChannelBus, InboundEvent, ReplyDispatcher};
use wxgate::gateway::Gateway;

const BUS_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "wxgate")]
#[command(about = "WeChat webhook gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the gateway. Push deliveries are held open until a reply for their message id arrives.
    Serve {
        /// Config file path (default: WXGATE_CONFIG_PATH or ~/.wxgate/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP port (default from config or 8080)
        #[arg(long, short)]
        port: Option<u16>,

        /// Reply to every push with its own content instead of waiting for the reply path.
        #[arg(long)]
        echo: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("wxgate {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve { config, port, echo }) => {
            if let Err(e) = run_serve(config, port, echo).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
    echo: bool,
) -> anyhow::Result<()> {
    let (mut config, path) = wxgate::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    if !echo && config.gateway.reply_path.is_none() {
        log::warn!("no gateway.replyPath configured and --echo not set: pushes will only be answered on expiry");
    }
    log::info!(
        "starting gateway on {}:{} (config {})",
        config.gateway.bind,
        config.gateway.port,
        path.display()
    );

    let (bus, mut rx) = ChannelBus::new(BUS_CAPACITY);
    let gateway = Gateway::new(config, Arc::new(bus))?;
    let dispatcher = gateway.dispatcher();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            consume(&dispatcher, event, echo).await;
        }
    });
    gateway.run().await
}

/// Consume one published event: echo it back, or log it for an external replier.
async fn consume(dispatcher: &ReplyDispatcher, event: InboundEvent, echo: bool) {
    if echo {
        match dispatcher.dispatch(&event.message_id, &event.content).await {
            Ok(()) => log::debug!("echoed message {}", event.message_id),
            Err(e) => log::debug!("echo for message {} not delivered: {}", event.message_id, e),
        }
        return;
    }
    match serde_json::to_string(&event) {
        Ok(json) => log::info!("inbound event: {}", json),
        Err(e) => log::warn!("inbound event {} not serialisable: {}", event.message_id, e),
    }
}
