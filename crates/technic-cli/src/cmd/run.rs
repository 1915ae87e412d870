use std::path::Path;
use std::time::Duration;

use technic_core::config::MAX_CADENCE_MINUTES;

use super::{build_scheduler, runtime};

/// Tick at the configured cadence until Ctrl-C. The tick in progress when
/// the signal arrives is finished first. The store is only locked while a
/// tick touches it, so other commands keep working alongside.
pub fn run(root: &Path, cadence_minutes: Option<u64>) -> anyhow::Result<()> {
    let (config, scheduler) = build_scheduler(root)?;
    let cadence = match cadence_minutes {
        Some(0) => anyhow::bail!("--cadence-minutes must be greater than 0"),
        Some(m) if m > MAX_CADENCE_MINUTES => {
            anyhow::bail!("--cadence-minutes must be at most {MAX_CADENCE_MINUTES}")
        }
        Some(m) => Duration::from_secs(m * 60),
        None => config.scheduler.cadence(),
    };

    runtime()?.block_on(async move {
        let shutdown = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutdown requested"),
                Err(e) => {
                    tracing::error!(error = %e, "cannot listen for Ctrl-C; stop the process to exit");
                    std::future::pending::<()>().await;
                }
            }
        };
        scheduler.run(cadence, shutdown).await;
    });
    Ok(())
}
