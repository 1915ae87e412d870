pub mod approval;
pub mod check;
pub mod init;
pub mod request;
pub mod run;
pub mod tick;

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use technic_core::{config::Config, paths, scheduler::Scheduler, store::RequestDb, TechnicError};
use uuid::Uuid;

pub fn load_config(root: &Path) -> anyhow::Result<Config> {
    Config::load(root).context("failed to load .technic/config.yaml")
}

/// Open the request store of an initialized installation.
pub fn open_store(root: &Path) -> anyhow::Result<RequestDb> {
    if !paths::technic_dir(root).is_dir() {
        return Err(TechnicError::NotInitialized.into());
    }
    RequestDb::open(&paths::db_path(root)).context("failed to open the request store")
}

pub fn parse_id(raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("invalid request id '{raw}'"))
}

/// A scheduler over the installation's store, refusing to start on an
/// invalid configuration.
pub fn build_scheduler(root: &Path) -> anyhow::Result<(Config, Scheduler)> {
    let config = load_config(root)?;
    config.ensure_valid()?;
    let store = Arc::new(open_store(root)?);
    let scheduler = Scheduler::from_config(store, &config).context("failed to set up backends")?;
    Ok((config, scheduler))
}

pub fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to start the async runtime")
}
