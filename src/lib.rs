// The link seams are consumed generically (static dispatch only), so the
// auto-trait caveat behind this lint does not apply.
#![allow(async_fn_in_trait)]

use std::env;
use log::{info, warn};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub mod actions;
pub mod activity;
pub mod cache;
pub mod config;
pub mod debounce;
pub mod error;
pub mod link;
pub mod mapper;
pub mod session;
pub mod uhid;

use crate::actions::ActionMap;
use crate::activity::FileActivityProbe;
use crate::cache::AttributeCache;
use crate::config::Config;
use crate::error::ConfigError;
use crate::link::RadioFactory;
use crate::session::ConnectionSupervisor;

pub fn init_logging(debug: bool) {
    let level = if debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}

/// Runs the daemon until a shutdown signal arrives: one supervisor, one
/// session per configured remote, all multiplexed on the current thread.
pub async fn run<F: RadioFactory>(config: Config, factory: F) -> Result<(), ConfigError> {
    let addresses = config.device_addresses()?;

    let state_dir = config::io::state_dir(&config)?;
    let mut locker = config::io::instance_locker(&state_dir)?;
    let _lock = locker.try_write().map_err(|source| ConfigError::AlreadyRunning {
        path: state_dir.display().to_string(),
        source,
    })?;

    let cache = AttributeCache::new(state_dir.join("cache"));
    let actions = ActionMap::from_config(&config.buttons);
    let probe = FileActivityProbe::new(config.activity.input_nodes.clone());

    let supervisor = ConnectionSupervisor::new(&config, cache, &actions, factory, probe);
    let cancel = CancellationToken::new();

    let supervisor_run = supervisor.run(addresses, cancel.clone());
    tokio::pin!(supervisor_run);

    let signalled = tokio::select! {
        _ = shutdown_signal() => true,
        _ = &mut supervisor_run => false,
    };

    if signalled {
        info!("Shutdown signal received");
        cancel.cancel();

        // Bounded grace for session teardown; whatever is still pending
        // afterwards is dropped with the runtime.
        if timeout(config.connection.shutdown_grace(), &mut supervisor_run).await.is_err() {
            warn!("Sessions did not stop within the grace period, exiting anyway");
        }
    } else {
        info!("All session loops ended");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
