use std::{path::PathBuf, sync::Arc, time::Duration};

use apdu_transport_omapi::{
    OmapiPlugin,
    sim::{Delivery, SimConnector, SimEnvironment, SimService},
};
use clap::{Parser, Subcommand};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(version, about = "Explore secure elements through the OMAPI transport")]
struct Cli {
    /// TOML profile describing the plugin options and the simulated service
    #[arg(short, long)]
    profile: Option<PathBuf>,

    /// Reader to use (first reader with a secure element if not specified)
    #[arg(short, long)]
    reader: Option<String>,

    /// Bind through the SIMalliance service instead of the platform one
    #[arg(long)]
    simalliance: bool,

    /// Trace level output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available readers
    List,

    /// Show the Answer To Reset of the secure element
    Atr,

    /// Open a channel and show the select response
    Select {
        /// AID in hex, the basic channel is opened if omitted
        aid: Option<String>,

        /// SELECT P2 parameter in hex
        #[arg(short, long, default_value = "00", value_parser = parse_hex_byte)]
        mask: u8,
    },

    /// Open a channel and exchange APDUs over it
    Transmit {
        /// AID in hex, the basic channel is opened if omitted
        #[arg(long)]
        aid: Option<String>,

        /// SELECT P2 parameter in hex
        #[arg(short, long, default_value = "00", value_parser = parse_hex_byte)]
        mask: u8,

        /// Command APDUs in hex
        #[arg(required = true)]
        apdus: Vec<String>,
    },
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let profile = config::load_profile(cli.profile.as_deref())?;
    let service = Arc::new(SimService::new(profile.service)?);
    let connector = Arc::new(SimConnector::new(service, Delivery::Executor));
    let env = if cli.simalliance {
        SimEnvironment::simalliance(connector)
    } else {
        SimEnvironment::platform(connector)
    };

    let plugin = OmapiPlugin::from_environment(&env, profile.omapi)?;
    let connected = plugin.connect_channel()?.recv_timeout(CONNECT_TIMEOUT)?;
    info!(
        plugin = %connected.plugin,
        version = %connected.version,
        backend = %connected.backend,
        "Plugin ready"
    );

    let reader = cli.reader.as_deref();
    match &cli.command {
        Commands::List => commands::list_readers(&plugin),
        Commands::Atr => {
            let mut reader = commands::find_reader(&plugin, reader)?;
            commands::atr(&mut reader)?;
        }
        Commands::Select { aid, mask } => {
            let aid = aid.as_deref().map(hex::decode).transpose()?;
            let mut reader = commands::find_reader(&plugin, reader)?;
            commands::select(&mut reader, aid.as_deref(), *mask)?;
        }
        Commands::Transmit { aid, mask, apdus } => {
            let aid = aid.as_deref().map(hex::decode).transpose()?;
            let apdus = apdus
                .iter()
                .map(hex::decode)
                .collect::<Result<Vec<_>, _>>()?;
            let mut reader = commands::find_reader(&plugin, reader)?;
            commands::transmit(&mut reader, aid.as_deref(), *mask, &apdus)?;
        }
    }

    Ok(())
}

fn parse_hex_byte(s: &str) -> Result<u8, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("invalid hex byte '{s}': {e}"))
}

fn setup_logging(verbose: bool) {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose, &directives))
        .with_ansi(true)
        .init();
}

/// `RUST_LOG` style directives over a default level picked by `verbose`
fn log_filter(verbose: bool, directives: &str) -> EnvFilter {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(directives)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        assert_eq!(log_filter(false, "").to_string().to_lowercase(), "info");
        assert_eq!(log_filter(true, "").to_string().to_lowercase(), "debug");
    }

    #[test]
    fn test_env_directives_win() {
        let filter = log_filter(true, "apdu_transport_omapi=trace").to_string();
        assert!(filter.to_lowercase().contains("apdu_transport_omapi=trace"));
    }

    #[test]
    fn test_parse_hex_byte() {
        assert_eq!(parse_hex_byte("0C"), Ok(0x0C));
        assert_eq!(parse_hex_byte("0x04"), Ok(0x04));
        assert!(parse_hex_byte("100").is_err());
    }
}
