//! Tabular output for summaries and listings.

use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use penumbra_schema::{DeviceInfo, InstalledPackage, JobSummary, RepoStatus, RepositoryDescriptor};

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn status_cell(status: &RepoStatus) -> Cell {
    let color = match status {
        RepoStatus::Done => Color::Green,
        RepoStatus::Failed { .. } => Color::Red,
        RepoStatus::Cancelled => Color::Yellow,
        _ => Color::Cyan,
    };
    let text = match status {
        RepoStatus::Failed { kind, reason } => format!("failed ({kind:?}): {reason}"),
        other => other.to_string(),
    };
    Cell::new(text).fg(color)
}

/// Final per-repository outcome of a job.
pub fn summary_table(summary: &JobSummary) -> Table {
    let mut table = table();
    table.set_header(vec!["repository", "status"]);
    for (name, status) in &summary.repositories {
        table.add_row(vec![Cell::new(name), status_cell(status)]);
    }
    table
}

pub fn repository_table(repositories: &[RepositoryDescriptor]) -> Table {
    let mut table = table();
    table.set_header(vec!["name", "source", "description"]);
    for repo in repositories {
        table.add_row(vec![
            Cell::new(&repo.name),
            Cell::new(format!("{}/{}", repo.owner, repo.repo)).fg(Color::DarkGrey),
            Cell::new(repo.description.as_deref().unwrap_or("")),
        ]);
    }
    table
}

pub fn package_table(packages: &[InstalledPackage]) -> Table {
    let mut table = table();
    table.set_header(vec!["package", "version"]);
    for package in packages {
        table.add_row(vec![
            Cell::new(&package.name),
            Cell::new(package.version.as_deref().unwrap_or("-")),
        ]);
    }
    table
}

pub fn device_table(info: &DeviceInfo) -> Table {
    let mut table = table();
    let state = if info.connected {
        Cell::new("connected").fg(Color::Green)
    } else {
        Cell::new(format!("{:?}", info.state).to_lowercase()).fg(Color::Red)
    };
    table.add_row(vec![Cell::new("state"), state]);
    table.add_row(vec![
        Cell::new("devices"),
        Cell::new(info.device_count.to_string()),
    ]);
    if let Some(serial) = &info.serial {
        table.add_row(vec![Cell::new("serial"), Cell::new(serial)]);
    }
    if let Some(message) = &info.error_message {
        table.add_row(vec![Cell::new("error"), Cell::new(message).fg(Color::Red)]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use penumbra_schema::{ErrorKind, JobId, JobState, Operation};
    use std::collections::BTreeMap;

    #[test]
    fn test_summary_table_lists_every_repository() {
        let summary = JobSummary {
            job_id: JobId(3),
            operation: Operation::Install,
            state: JobState::Completed,
            repositories: BTreeMap::from([
                ("mabl".to_string(), RepoStatus::Done),
                (
                    "pinitd".to_string(),
                    RepoStatus::Failed {
                        kind: ErrorKind::RateLimited,
                        reason: "host throttled request".to_string(),
                    },
                ),
            ]),
            rebooted: false,
        };
        let rendered = summary_table(&summary).to_string();
        assert!(rendered.contains("mabl"));
        assert!(rendered.contains("RateLimited"));
    }
}
