use crate::output::print_json;
use chrono::Utc;
use std::path::Path;

use super::{build_scheduler, runtime};

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let (_, scheduler) = build_scheduler(root)?;
    let summary = runtime()?.block_on(scheduler.run_tick(Utc::now()));

    if json {
        return print_json(&summary);
    }
    println!(
        "processed {}: {} approved, {} rejected, {} expired, {} dispatched \
         ({} succeeded, {} retried, {} failed), {} deferred, {} unchanged",
        summary.processed,
        summary.approved,
        summary.rejected,
        summary.expired,
        summary.dispatched,
        summary.succeeded,
        summary.retried,
        summary.failed,
        summary.deferred,
        summary.unchanged,
    );
    Ok(())
}
