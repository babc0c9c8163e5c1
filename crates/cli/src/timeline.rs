//! `semmerge timeline`: browse stored timelines and record landed commits.

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use semmerge_core::config::MergeConfig;
use semmerge_core::models::{content_hash, MainBranchEvent};
use semmerge_core::timeline::{TimelineEvent, TimelineEventKind};
use semmerge_core::MergeEngine;

use crate::style;

#[derive(Subcommand, Debug)]
pub enum TimelineAction {
    /// List every tracked file with event counts and pending tasks.
    List,

    /// Show the full event history of one file.
    Show {
        /// Repository-relative file path.
        file: String,
    },

    /// Record that tasks' work on a file landed on the shared branch.
    Land {
        /// Repository-relative file path.
        file: String,
        /// Commit that integrated the tasks.
        #[arg(long)]
        commit: String,
        /// Task ids integrated by the commit (repeatable).
        #[arg(long = "task", required = true)]
        tasks: Vec<String>,
        /// File whose content is the landed version; hashed for the record.
        #[arg(long)]
        content: std::path::PathBuf,
        /// Optional free-form description.
        #[arg(long)]
        description: Option<String>,
    },
}

pub async fn run_timeline(config: &MergeConfig, action: TimelineAction) -> Result<()> {
    // Browsing never calls the resolver.
    let engine = MergeEngine::new(config, None);

    match action {
        TimelineAction::List => {
            let timelines = engine
                .store()
                .load_all(config.engine.quarantine_corrupt_timelines)
                .context("failed to load timelines")?;
            if timelines.is_empty() {
                println!("No timelines stored under {}", config.storage.root.display());
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["File", "Events", "Snapshots", "Merges", "Landed", "Pending Tasks"]);
            for (file, timeline) in &timelines {
                table.add_row(vec![
                    Cell::new(file),
                    Cell::new(timeline.events.len()),
                    Cell::new(timeline.snapshots().count()),
                    Cell::new(timeline.merge_results().count()),
                    Cell::new(timeline.main_branch_events().count()),
                    Cell::new(timeline.pending_tasks().join(", ")),
                ]);
            }
            println!("{}", style::header("Tracked files"));
            println!("{}", table);
        }

        TimelineAction::Show { file } => {
            let timeline = engine
                .read_timeline(&file)
                .await
                .with_context(|| format!("failed to load timeline for {}", file))?;
            if timeline.events.is_empty() {
                println!("No events recorded for {}", file);
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["Time", "Event", "Tasks", "Detail"]);
            for event in &timeline.events {
                table.add_row(event_row(event));
            }
            println!("{}", style::header(&format!("Timeline of {}", file)));
            println!("{}", table);
        }

        TimelineAction::Land {
            file,
            commit,
            tasks,
            content,
            description,
        } => {
            let landed = std::fs::read_to_string(&content)
                .with_context(|| format!("failed to read {}", content.display()))?;
            let event = MainBranchEvent {
                commit_ref: commit.clone(),
                task_ids: tasks,
                content_hash: content_hash(&landed),
                description,
            };
            engine
                .record_landed(&file, event)
                .await
                .context("failed to record main branch event")?;
            println!("{}", style::success(&format!("Recorded {} on {}", commit, file)));
        }
    }

    Ok(())
}

fn event_row(event: &TimelineEvent) -> Vec<Cell> {
    let time = Cell::new(event.timestamp.format("%Y-%m-%d %H:%M:%S").to_string());
    match &event.kind {
        TimelineEventKind::Snapshot(s) => vec![
            time,
            Cell::new("snapshot"),
            Cell::new(&s.task_id),
            Cell::new(format!(
                "{} change(s); {}",
                s.semantic_changes.len(),
                style::dim(&s.task_intent)
            )),
        ],
        TimelineEventKind::MergeResult(r) => vec![
            time,
            style::decision_cell(r.decision),
            Cell::new(r.tasks_involved.join(", ")),
            Cell::new(format!("{} ({})", r.location, r.severity)),
        ],
        TimelineEventKind::MainBranchEvent(m) => vec![
            time,
            Cell::new("landed"),
            Cell::new(m.task_ids.join(", ")),
            Cell::new(match &m.description {
                Some(d) => format!("{}: {}", m.commit_ref, d),
                None => m.commit_ref.clone(),
            }),
        ],
    }
}
