//! Command execution.

use crate::Commands;
use colored::Colorize;
use london_client::{ClientError, Config, Context, Dsp};
use london_protocol::{Block, Command, Method, ProtocolError, StateVariable, MIN_SUBSCRIBE_INTERVAL};
use serde_json::{json, Value};

/// Executes a device command and returns the formatted output.
pub async fn execute(
    dsp: &Dsp,
    config: &Config,
    ctx: &Context,
    cmd: Commands,
    json: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Encode { .. } | Commands::Blocks => unreachable!(),

        Commands::GetMute { block } => {
            let muted = dsp.get_mute(ctx, config.resolve_block(&block)).await?;
            if json {
                return Ok(format_json(&json!({ "block": block, "muted": muted })));
            }
            Ok(format!("{}: {}", block.cyan(), switch_label(muted, "muted", "unmuted")))
        }

        Commands::SetMute { block, muted } => {
            dsp.set_mute(ctx, config.resolve_block(&block), muted).await?;
            if json {
                return Ok(format_json(&json!({ "block": block, "muted": muted })));
            }
            Ok(format!(
                "{} {}",
                if muted { "Muted".red() } else { "Unmuted".green() },
                block.cyan()
            ))
        }

        Commands::GetVolume { block } => {
            let level = dsp.get_volume(ctx, config.resolve_block(&block)).await?;
            if json {
                return Ok(format_json(&json!({ "block": block, "volume": level })));
            }
            Ok(format!("{}: {}%", block.cyan(), level.to_string().yellow()))
        }

        Commands::SetVolume { block, level } => {
            dsp.set_volume(ctx, config.resolve_block(&block), level).await?;
            if json {
                return Ok(format_json(&json!({ "block": block, "volume": level })));
            }
            Ok(format!(
                "{} {} to {}%",
                "Set".green(),
                block.cyan(),
                level.to_string().yellow()
            ))
        }

        Commands::GetPolarity { block } => {
            let inverted = dsp.get_polarity(ctx, config.resolve_block(&block)).await?;
            if json {
                return Ok(format_json(&json!({ "block": block, "inverted": inverted })));
            }
            Ok(format!(
                "{}: {}",
                block.cyan(),
                switch_label(inverted, "inverted", "normal")
            ))
        }

        Commands::SetPolarity { block, inverted } => {
            dsp.set_polarity(ctx, config.resolve_block(&block), inverted)
                .await?;
            if json {
                return Ok(format_json(&json!({ "block": block, "inverted": inverted })));
            }
            Ok(format!(
                "{} {} polarity",
                if inverted { "Inverted".yellow() } else { "Restored".green() },
                block.cyan()
            ))
        }
    }
}

/// Builds a command from CLI arguments.
pub fn encode(
    config: &Config,
    method: &str,
    state: &str,
    block: &str,
    data: Option<&str>,
    interval: Option<u32>,
) -> Result<Command, ClientError> {
    let method: Method = method.parse()?;
    let state: StateVariable = state.parse()?;
    let block: Block = config.resolve_block(block).parse()?;
    let units = method.units();

    let command = match method {
        Method::Set | Method::SetPercent => {
            let data = data.ok_or_else(|| {
                ProtocolError::InvalidArgument(format!("{} needs --data", method))
            })?;
            let payload = hex::decode(data).map_err(|e| {
                ProtocolError::InvalidArgument(format!("invalid --data '{}': {}", data, e))
            })?;
            Command::new(method, state, block, &payload)?
        }
        Method::Subscribe | Method::SubscribePercent => Command::subscribe(
            units,
            state,
            block,
            interval.unwrap_or(MIN_SUBSCRIBE_INTERVAL),
        )?,
        Method::Unsubscribe | Method::UnsubscribePercent => {
            Command::unsubscribe(units, state, block)
        }
    };

    Ok(command)
}

/// Formats an encoded command.
pub fn format_frame(command: &Command, json: bool) -> String {
    let frame = match command.encode() {
        Ok(frame) => hex::encode_upper(&frame),
        Err(e) => return format!("{}: {}", "Error".red(), e),
    };

    if json {
        return format_json(&json!({
            "method": command.method.to_string(),
            "state": command.state.to_string(),
            "block": command.block.to_string(),
            "payload": hex::encode_upper(command.payload),
            "frame": frame,
        }));
    }

    let spaced: Vec<&str> = (0..frame.len())
        .step_by(2)
        .map(|i| &frame[i..i + 2])
        .collect();
    spaced.join(" ")
}

/// Lists configured block aliases.
pub fn list_blocks(config: &Config, json: bool) -> String {
    if json {
        return format_json(&json!(config.blocks));
    }

    if config.blocks.is_empty() {
        return "No blocks configured".yellow().to_string();
    }

    let width = config.blocks.keys().map(|k| k.len()).max().unwrap_or(0);
    let mut output = String::new();
    for (alias, address) in &config.blocks {
        let alias = format!("{:width$}", alias, width = width);
        output.push_str(&format!("  {}  {}\n", alias.cyan(), address));
    }
    output.trim_end().to_string()
}

fn switch_label(on: bool, on_label: &str, off_label: &str) -> String {
    if on {
        on_label.red().to_string()
    } else {
        off_label.green().to_string()
    }
}

fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
