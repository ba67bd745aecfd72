use crate::config::Config;
use crate::error::UnitError;
use crate::models::{BrokerConfig, UnitConfig, UnitKind};
use crate::{mqtt2rest_unit, rest2mqtt_unit};
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A spawned unit worker.
pub struct UnitHandle {
    pub name: String,
    pub kind: UnitKind,
    pub task: JoinHandle<Result<(), UnitError>>,
}

/// Spawn one worker per enabled unit. Disabled units are skipped.
pub fn start_units(config: &Config, cancel: &CancellationToken) -> Vec<UnitHandle> {
    let broker = Arc::new(config.broker.clone());

    config
        .units()
        .into_iter()
        .filter_map(|unit| {
            if !unit.enabled() {
                debug!("Unit [{}]: disabled, not started", unit.name());
                return None;
            }
            Some(start_unit(unit, broker.clone(), cancel.clone()))
        })
        .collect()
}

fn start_unit(unit: UnitConfig, broker: Arc<BrokerConfig>, cancel: CancellationToken) -> UnitHandle {
    let name = unit.name().to_string();
    let kind = unit.kind();
    info!("Unit [{}]: spawning {} worker", name, kind);

    let task = match unit {
        UnitConfig::Mqtt2Rest(unit) => tokio::spawn(mqtt2rest_unit::run(unit, broker, cancel)),
        UnitConfig::Rest2Mqtt(unit) => tokio::spawn(rest2mqtt_unit::run(unit, broker, cancel)),
    };

    UnitHandle { name, kind, task }
}

/// Cancel `cancel` on SIGINT, or SIGTERM on unix.
pub async fn handle_shutdown(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for termination signal: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
        () = cancel.cancelled() => return,
    }

    info!("Shutdown requested, stopping units...");
    cancel.cancel();
}

/// Wait for all workers. Returns the number of units that ended with an error.
pub async fn join_units(units: Vec<UnitHandle>) -> usize {
    let (labels, tasks): (Vec<_>, Vec<_>) = units
        .into_iter()
        .map(|unit| ((unit.name, unit.kind), unit.task))
        .unzip();

    let mut failed = 0;
    for ((name, kind), result) in labels.into_iter().zip(join_all(tasks).await) {
        match result {
            Ok(Ok(())) => info!("Unit [{}]: {} worker finished", name, kind),
            Ok(Err(e)) => {
                failed += 1;
                error!("Unit [{}]: {} worker failed: {}", name, kind, e);
            }
            Err(e) => {
                failed += 1;
                error!("Unit [{}]: {} worker panicked: {}", name, kind, e);
            }
        }
    }
    failed
}

/// Run every enabled unit until shutdown. Returns the number of failed units.
pub async fn run_units(config: &Config, cancel: CancellationToken) -> usize {
    let units = start_units(config, &cancel);
    info!("{} units running", units.len());

    let signals = tokio::spawn(handle_shutdown(cancel.clone()));
    let failed = join_units(units).await;

    // all workers gone on their own: release the signal listener too
    cancel.cancel();
    let _ = signals.await;
    failed
}
