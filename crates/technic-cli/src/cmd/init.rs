use anyhow::Context;
use std::path::Path;
use technic_core::{config::CONFIG_TEMPLATE, io, paths, store::RequestDb};

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing technic in: {}", root.display());

    let dir = paths::technic_dir(root);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config_path = paths::config_path(root);
    if io::write_if_missing(&config_path, CONFIG_TEMPLATE.as_bytes())
        .context("failed to write config.yaml")?
    {
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }

    let db_path = paths::db_path(root);
    let existed = db_path.exists();
    RequestDb::open(&db_path).context("failed to create the request store")?;
    if existed {
        println!("  exists:  {}", paths::DB_FILE);
    } else {
        println!("  created: {}", paths::DB_FILE);
    }

    println!("\nReview {} before running 'technic check'.", paths::CONFIG_FILE);
    Ok(())
}
