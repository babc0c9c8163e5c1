//! `semmerge merge`: run the engine over a manifest of task outputs.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use semmerge_core::config::MergeConfig;
use semmerge_core::engine::FileMergeOutcome;
use semmerge_core::models::{MergeDecision, MergeResult};
use semmerge_core::{FileMergeRequest, MergeEngine};

use crate::{signals, style};

/// Input file for a merge run.
#[derive(Debug, Deserialize)]
struct Manifest {
    files: Vec<FileMergeRequest>,
}

/// JSON shape printed with `--json`.
#[derive(Debug, Serialize)]
struct FileReport<'a> {
    file_path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<&'a FileMergeOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn run_merge(
    config: &MergeConfig,
    manifest_path: &Path,
    output: Option<&Path>,
    json: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(manifest_path)
        .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;
    let manifest: Manifest = serde_json::from_str(&raw).context("failed to parse manifest")?;
    let paths: Vec<String> = manifest.files.iter().map(|f| f.file_path.clone()).collect();

    let cancel = CancellationToken::new();
    tokio::spawn(signals::cancel_on_signal(cancel.clone()));

    let engine = MergeEngine::from_config(config);
    let outcomes = engine.run(manifest.files, cancel.clone()).await;
    cancel.cancel();

    if let Some(dir) = output {
        for outcome in outcomes.iter().flatten() {
            if let Some(content) = &outcome.merged_content {
                write_merged(dir, &outcome.file_path, content)?;
            }
        }
    }

    let mut errors = 0usize;
    let mut escalations = 0usize;
    for outcome in &outcomes {
        match outcome {
            Ok(o) => escalations += o.escalations().count(),
            Err(_) => errors += 1,
        }
    }

    if json {
        let reports: Vec<FileReport<'_>> = paths
            .iter()
            .zip(&outcomes)
            .map(|(path, outcome)| match outcome {
                Ok(o) => FileReport {
                    file_path: path,
                    outcome: Some(o),
                    error: None,
                },
                Err(e) => FileReport {
                    file_path: path,
                    outcome: None,
                    error: Some(e.to_string()),
                },
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_table(&paths, &outcomes);
        if let Some(dir) = output {
            println!("{}", style::dim(&format!("merged files written under {}", dir.display())));
        }
    }

    if errors > 0 || escalations > 0 {
        anyhow::bail!(
            "{} file(s) could not be merged, {} region(s) need attention",
            errors,
            escalations
        );
    }
    Ok(())
}

/// Write `content` to `dir/file_path`, refusing paths that escape `dir`.
fn write_merged(dir: &Path, file_path: &str, content: &str) -> Result<()> {
    let relative = Path::new(file_path);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        anyhow::bail!("refusing to write outside the output directory: {}", file_path);
    }
    let target = dir.join(relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&target, content)
        .with_context(|| format!("failed to write {}", target.display()))
}

fn detail(result: &MergeResult) -> String {
    match result.decision {
        MergeDecision::Failed => result
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default(),
        MergeDecision::HumanRequired => result.reason.clone().unwrap_or_default(),
        _ => String::new(),
    }
}

fn print_table(
    paths: &[String],
    outcomes: &[Result<FileMergeOutcome, semmerge_core::errors::CoreError>],
) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["File", "Location", "Severity", "Decision", "Strategy", "Detail"]);

    for (path, outcome) in paths.iter().zip(outcomes) {
        match outcome {
            Err(e) => {
                table.add_row(vec![
                    Cell::new(path),
                    Cell::new(""),
                    Cell::new(""),
                    Cell::new("✗ error").fg(comfy_table::Color::Red),
                    Cell::new(""),
                    Cell::new(e.to_string()),
                ]);
            }
            Ok(o) if o.skipped => {
                table.add_row(vec![
                    Cell::new(path),
                    Cell::new(""),
                    Cell::new(""),
                    Cell::new("skipped"),
                    Cell::new(""),
                    Cell::new("matches a skip pattern"),
                ]);
            }
            Ok(o) if o.results.is_empty() => {
                table.add_row(vec![
                    Cell::new(path),
                    Cell::new(""),
                    Cell::new(""),
                    Cell::new("unchanged"),
                    Cell::new(""),
                    Cell::new(""),
                ]);
            }
            Ok(o) => {
                for result in &o.results {
                    table.add_row(vec![
                        Cell::new(path),
                        Cell::new(&result.location),
                        style::severity_cell(result.severity),
                        style::decision_cell(result.decision),
                        Cell::new(result.strategy_used.as_deref().unwrap_or("")),
                        Cell::new(detail(result)),
                    ]);
                }
            }
        }
    }

    println!("{}", style::header("Merge results"));
    println!("{}", table);

    let merged = outcomes
        .iter()
        .flatten()
        .filter(|o| o.merged_content.is_some())
        .count();
    let summary = format!("{} of {} file(s) fully merged", merged, outcomes.len());
    if merged == outcomes.len() {
        println!("{}", style::success(&summary));
    } else {
        println!("{}", style::warn(&summary));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_parses_minimal_tasks() {
        let raw = r#"{"files":[{"file_path":"a.py","baseline":"x = 1\n","tasks":[{"task_id":"t1","after":"x = 2\n"}]}]}"#;
        let manifest: Manifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].tasks[0].task_id, "t1");
        assert!(manifest.files[0].tasks[0].intent.is_empty());
    }

    #[test]
    fn test_write_merged_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        assert!(write_merged(dir.path(), "../evil.py", "x").is_err());
        assert!(write_merged(dir.path(), "/etc/passwd", "x").is_err());

        write_merged(dir.path(), "pkg/ok.py", "x = 1\n").unwrap();
        let written = std::fs::read_to_string(dir.path().join("pkg/ok.py")).unwrap();
        assert_eq!(written, "x = 1\n");
    }
}
