//! london - BSS London DSP control
//!
//! One-shot commands against a device, plus offline frame encoding.

mod commands;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use london_client::{Config, Context, Dsp};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "london")]
#[command(about = "Control BSS London DSPs over the Direct Inject protocol")]
#[command(version)]
struct Cli {
    /// YAML config file
    #[arg(long, env = "LONDON_CONFIG")]
    config: Option<PathBuf>,

    /// Device address (host or host:port)
    #[arg(short, long)]
    address: Option<String>,

    /// Device port, used when the address has none
    #[arg(short, long)]
    port: Option<u16>,

    /// Overall timeout per operation, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show whether a block is muted
    GetMute {
        /// Block alias or hex address
        block: String,
    },

    /// Mute or unmute a block
    SetMute {
        /// Block alias or hex address
        block: String,

        /// true to mute, false to unmute
        #[arg(action = ArgAction::Set, value_parser = BoolishValueParser::new())]
        muted: bool,
    },

    /// Show the gain of a block (0-100)
    GetVolume {
        /// Block alias or hex address
        block: String,
    },

    /// Set the gain of a block (0-100)
    SetVolume {
        /// Block alias or hex address
        block: String,

        /// Level in percent
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        level: u8,
    },

    /// Show whether a block's polarity is inverted
    GetPolarity {
        /// Block alias or hex address
        block: String,
    },

    /// Invert or restore a block's polarity
    SetPolarity {
        /// Block alias or hex address
        block: String,

        /// true to invert, false to restore
        #[arg(action = ArgAction::Set, value_parser = BoolishValueParser::new())]
        inverted: bool,
    },

    /// Print the wire frame for a command without sending it
    Encode {
        /// set, set-percent, subscribe, unsubscribe, subscribe-percent, unsubscribe-percent
        method: String,

        /// gain, mute or polarity
        state: String,

        /// Block alias or hex address
        block: String,

        /// Payload for set commands (4 bytes, hex)
        #[arg(long, conflicts_with = "interval")]
        data: Option<String>,

        /// Report interval for subscribe commands, in milliseconds
        #[arg(long)]
        interval: Option<u32>,
    },

    /// List configured block aliases
    Blocks,
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env_overrides();
            tracing::debug!("Loaded config from {}", path.display());
            config
        }
        None => Config::from_env(),
    };

    if let Some(address) = &cli.address {
        config.device.address = address.clone();
    }
    if let Some(port) = cli.port {
        config.device.port = port;
    }
    if let Some(ms) = cli.timeout_ms {
        config.timeouts.overall_ms = ms;
        config.timeouts.write_ms = config.timeouts.write_ms.min(ms);
        config.timeouts.read_ms = config.timeouts.read_ms.min(ms);
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            std::process::exit(1);
        }
    };

    // Offline commands need no device
    let offline: Option<Result<String, Box<dyn std::error::Error>>> = match cli.command {
        Commands::Encode {
            ref method,
            ref state,
            ref block,
            ref data,
            interval,
        } => Some(
            commands::encode(&config, method, state, block, data.as_deref(), interval)
                .map(|frame| commands::format_frame(&frame, cli.json))
                .map_err(|e| e.into()),
        ),
        Commands::Blocks => Some(Ok(commands::list_blocks(&config, cli.json))),
        _ => None,
    };

    let result = match offline {
        Some(result) => result,
        None => {
            let dsp = match Dsp::from_config(&config) {
                Ok(dsp) => dsp,
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            };

            let (ctx, cancel) = Context::background().with_cancel();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            commands::execute(&dsp, &config, &ctx, cli.command, cli.json).await
        }
    };

    match result {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
