//! `cage ps` command - List provisioned containers.

use cage_core::config::CageConfig;
use cage_runtime::{list_containers, ContainerEntry, SPEC_FILE};
use chrono::{DateTime, Utc};
use clap::Args;

use crate::output;

#[derive(Args, Default)]
pub struct PsArgs {
    /// Only display container IDs
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PsArgs, config: CageConfig) -> Result<(), Box<dyn std::error::Error>> {
    let entries = list_containers(&config)?;

    if args.quiet {
        for entry in &entries {
            println!("{}", entry.id);
        }
        return Ok(());
    }

    let mut table = output::new_table(&["CONTAINER ID", "STATUS", "CREATED", "PATH"]);
    for entry in &entries {
        let created = spec_time(entry)
            .map(|t| output::format_ago(&t))
            .unwrap_or_else(|| "-".to_string());
        let path = entry.path.display().to_string();
        table.add_row([
            entry.id.as_str(),
            status(entry),
            created.as_str(),
            path.as_str(),
        ]);
    }

    println!("{table}");
    Ok(())
}

/// A container without a written spec was interrupted mid-provisioning.
fn status(entry: &ContainerEntry) -> &'static str {
    if entry.has_spec {
        "created"
    } else {
        "incomplete"
    }
}

fn spec_time(entry: &ContainerEntry) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(entry.path.join(SPEC_FILE))
        .and_then(|m| m.modified())
        .ok()?;
    Some(DateTime::<Utc>::from(modified))
}
