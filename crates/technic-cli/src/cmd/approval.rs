use crate::output::print_json;
use chrono::Utc;
use std::path::Path;
use technic_core::{approval::record_approval, types::Decision};

use super::{open_store, parse_id};

pub fn run(
    root: &Path,
    id: &str,
    owner: &str,
    decision: Decision,
    comment: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    let store = open_store(root)?;
    let request = record_approval(&store, id, owner.trim(), decision, comment, Utc::now())?;

    if json {
        print_json(&request)?;
    } else {
        println!("{owner}: {decision}");
        println!("request {}: {}", request.id, request.status);
    }
    Ok(())
}
