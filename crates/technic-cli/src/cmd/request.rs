use crate::output::{opt_time, print_json, print_table, short_time};
use chrono::Utc;
use clap::Subcommand;
use std::path::Path;
use technic_core::{
    intake,
    request::{AccessRequest, NewAccessRequest},
    store::RequestStore,
    types::{ActionKind, RequestStatus},
};

use super::{load_config, open_store, parse_id};

#[derive(Subcommand)]
pub enum RequestSubcommand {
    /// Open a new access request
    Create {
        /// Account, device or mailbox owner the action applies to
        #[arg(long)]
        subject: String,
        /// grant-group, revoke-group, install-software or archive-mailbox
        #[arg(long)]
        action: String,
        /// Group, deployment collection or mailbox
        #[arg(long)]
        target: String,
        #[arg(long)]
        requested_by: String,
        /// Approving owner (repeat for several)
        #[arg(long = "owner", required = true)]
        owners: Vec<String>,
        /// Ticket or asset reference
        #[arg(long)]
        reference: Option<String>,
    },
    /// Show a request in full
    Show { id: String },
    /// List requests, newest first
    List {
        /// Only requests in this status
        #[arg(long)]
        status: Option<String>,
    },
}

pub fn run(root: &Path, subcmd: RequestSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        RequestSubcommand::Create {
            subject,
            action,
            target,
            requested_by,
            owners,
            reference,
        } => {
            let input = NewAccessRequest {
                subject,
                action_kind: action.parse::<ActionKind>()?,
                target_resource: target,
                requested_by,
                owners,
                reference,
            };
            create(root, input, json)
        }
        RequestSubcommand::Show { id } => show(root, &id, json),
        RequestSubcommand::List { status } => list(root, status.as_deref(), json),
    }
}

// ---------------------------------------------------------------------------
// create
// ---------------------------------------------------------------------------

fn create(root: &Path, input: NewAccessRequest, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let store = open_store(root)?;
    let request = intake::submit(&store, input, config.policy.approval_timeout(), Utc::now())?;

    if json {
        print_json(&request)?;
    } else {
        println!("{}", request.id);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let request = store.get(parse_id(id)?)?;

    if json {
        return print_json(&request);
    }

    println!("Request:   {}", request.id);
    println!("Status:    {}", request.status);
    println!(
        "Action:    {} {} -> {}",
        request.action_kind, request.subject, request.target_resource
    );
    println!("Requester: {}", request.requested_by);
    if let Some(reference) = &request.reference {
        println!("Reference: {reference}");
    }
    println!("Attempts:  {}", request.attempts);
    println!("Created:   {}", request.created_at.to_rfc3339());
    println!("Decided:   {}", opt_time(request.decided_at));
    println!("Executed:  {}", opt_time(request.executed_at));
    if !request.is_terminal() {
        println!("Next eval: {}", request.next_evaluation_at.to_rfc3339());
    }
    if let Some(err) = &request.last_error {
        println!("Error:     [{}] {} ({})", err.class, err.reason, err.at.to_rfc3339());
    }

    println!();
    let rows = request
        .owners
        .iter()
        .map(|owner| {
            let entry = request.approvals.get(owner);
            vec![
                owner.clone(),
                request.decision_of(owner).to_string(),
                opt_time(entry.and_then(|e| e.decided_at)),
                entry
                    .and_then(|e| e.comment.clone())
                    .unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["OWNER", "DECISION", "DECIDED", "COMMENT"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

fn list(root: &Path, status: Option<&str>, json: bool) -> anyhow::Result<()> {
    let status = status.map(str::parse::<RequestStatus>).transpose()?;
    let store = open_store(root)?;
    let requests = store.list(status)?;

    if json {
        return print_json(&requests);
    }
    if requests.is_empty() {
        println!("No requests.");
        return Ok(());
    }
    print_table(
        &["ID", "STATUS", "ACTION", "SUBJECT", "TARGET", "ATTEMPTS", "CREATED"],
        requests.iter().map(row).collect(),
    );
    Ok(())
}

fn row(r: &AccessRequest) -> Vec<String> {
    vec![
        r.id.to_string(),
        r.status.to_string(),
        r.action_kind.to_string(),
        r.subject.clone(),
        r.target_resource.clone(),
        r.attempts.to_string(),
        short_time(r.created_at),
    ]
}
