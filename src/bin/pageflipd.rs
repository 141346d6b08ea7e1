use std::path::PathBuf;
use std::process::ExitCode;
use clap::Parser;
use log::{error, info};

use pageflip::cache::AttributeCache;
use pageflip::config::io::{default_config_path, read_config, state_dir};
use pageflip::error::ConfigError;
use pageflip::link::btle::BtleRadioFactory;
use pageflip::link::Address;
use pageflip::{init_logging, run};

#[derive(Parser, Debug)]
#[command(name = "pageflipd", version, about = "BLE page-turner remote bridge daemon")]
struct Args {
    /// Path to the config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Connect to this remote address instead of the configured ones.
    #[arg(short, long)]
    address: Option<String>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    /// List remotes with cached discovery results, then exit.
    #[arg(long)]
    list_cache: bool,

    /// Clear cached discovery results for one remote ("all" clears
    /// everything), then exit.
    #[arg(long, value_name = "ADDRESS")]
    clear_cache: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);
    info!(concat!("pageflipd ", env!("CARGO_PKG_VERSION")));

    match main_inner(args).await {
        Ok(code) => code,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        },
    }
}

async fn main_inner(args: Args) -> Result<ExitCode, ConfigError> {
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };

    let mut config = read_config(&config_path).await?;

    if let Some(address) = &args.address {
        config.devices = vec![address.clone()];
    }

    if args.list_cache || args.clear_cache.is_some() {
        return cache_command(&args, &config).await;
    }

    run(config, BtleRadioFactory).await?;
    Ok(ExitCode::SUCCESS)
}

async fn cache_command(args: &Args, config: &pageflip::config::Config) -> Result<ExitCode, ConfigError> {
    let cache = AttributeCache::new(state_dir(config)?.join("cache"));

    if args.list_cache {
        let identities = cache.list_known_identities().await;
        if identities.is_empty() {
            println!("No cached remotes");
        }
        for identity in identities {
            println!("{}", identity);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let target = args.clear_cache.as_deref().expect("clear_cache checked by caller");
    let result = if target.eq_ignore_ascii_case("all") {
        cache.clear(None).await
    } else {
        let address = Address::parse(target).map_err(|reason| ConfigError::BadAddress {
            address: target.to_string(),
            reason,
        })?;
        cache.clear(Some(&address)).await
    };

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            error!("Failed to clear cache: {}", err);
            Ok(ExitCode::FAILURE)
        },
    }
}
