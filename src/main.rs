use clap::Parser;
use mqrestt::config::Config;
use mqrestt::logging;
use mqrestt::service_utils::run_units;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Bridge between MQTT topics and REST endpoints.
#[derive(Parser, Debug)]
#[command(name = "mqrestt", version, about, disable_version_flag = true)]
struct Args {
    /// Print version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    #[allow(dead_code)]
    version: Option<bool>,

    /// Configuration file (default: $MQRESTT_CONFIG or mqrestt.toml)
    #[arg(short = 'c', long = "configfile")]
    configfile: Option<PathBuf>,

    /// Print the parsed configuration to stderr before starting
    #[arg(short = 'p', long = "dump")]
    dump: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config = match Config::load(args.configfile) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config.loglevel, &config.logtarget, &config.logfile) {
        eprintln!("Error setting up logging: {}", e);
        return ExitCode::FAILURE;
    }

    if args.dump {
        match serde_json::to_string_pretty(&config) {
            Ok(dump) => eprintln!("{}", dump),
            Err(e) => eprintln!("Cannot dump configuration: {}", e),
        }
    }

    info!("mqrestt {} starting", env!("CARGO_PKG_VERSION"));
    let failed = run_units(&config, CancellationToken::new()).await;

    if failed > 0 {
        info!("Shut down, {} units failed", failed);
        return ExitCode::FAILURE;
    }
    info!("All units shut down successfully.");
    ExitCode::SUCCESS
}
