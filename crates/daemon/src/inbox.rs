//! File-driven submission.
//!
//! Drop a `*.json` file into the inbox directory: a plain job request, an
//! array of requests submitted as one batch, or a command such as
//! `{"action": "cancel", "job_id": "job_..."}`. Each file is handled once,
//! then renamed to `.submitted` or `.rejected`; rejections (and batch entries
//! that were refused) get a `.why.txt` sidecar with the reason.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, info, warn};
use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::job::JobRequest;
use crate::worker::WorkerPool;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum InboxCommand {
    Cancel { job_id: String },
    Delete { job_id: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InboxEntry {
    Command(InboxCommand),
    Batch(Vec<JobRequest>),
    Request(JobRequest),
}

/// One inbox file and what it parsed to
#[derive(Debug)]
pub struct InboxItem {
    pub path: PathBuf,
    pub entry: std::result::Result<InboxEntry, String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InboxSummary {
    /// Jobs queued, counting each batch entry
    pub submitted: usize,
    pub commands: usize,
    pub rejected: usize,
    /// Left in place for the next scan
    pub deferred: usize,
}

pub fn why_txt_path(file_path: &Path) -> PathBuf {
    let mut path = file_path.to_path_buf();
    path.set_extension("why.txt");
    path
}

pub fn write_why_txt(file_path: &Path, reason: &str) -> anyhow::Result<()> {
    let why_path = why_txt_path(file_path);
    fs::write(&why_path, reason)
        .with_context(|| format!("Failed to write why.txt: {}", why_path.display()))?;
    Ok(())
}

/// Read every `*.json` file in the inbox, oldest name first.
///
/// Files that fail to read or parse come back with the error text.
pub fn collect_requests(inbox_dir: &Path) -> Result<Vec<InboxItem>> {
    if !inbox_dir.exists() {
        fs::create_dir_all(inbox_dir)?;
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(inbox_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    paths.sort();

    Ok(paths
        .into_iter()
        .map(|path| {
            let entry = fs::read_to_string(&path)
                .map_err(|e| format!("unreadable: {}", e))
                .and_then(|content| {
                    serde_json::from_str::<InboxEntry>(&content)
                        .map_err(|e| format!("not a job request, batch or command: {}", e))
                });
            InboxItem { path, entry }
        })
        .collect())
}

fn rename_with(path: &Path, extension: &str) -> Result<PathBuf> {
    let target = path.with_extension(extension);
    fs::rename(path, &target)?;
    Ok(target)
}

pub fn mark_submitted(path: &Path) -> Result<PathBuf> {
    rename_with(path, "submitted")
}

pub fn mark_rejected(path: &Path, reason: &str) -> Result<PathBuf> {
    let target = rename_with(path, "rejected")?;
    write_why_txt(&target, reason)?;
    Ok(target)
}

/// Feed every inbox file to the pool.
///
/// A full queue defers the file to the next scan instead of rejecting it.
pub fn process_inbox(inbox_dir: &Path, pool: &WorkerPool) -> Result<InboxSummary> {
    let mut summary = InboxSummary::default();

    for item in collect_requests(inbox_dir)? {
        // Ok carries the notes to keep next to an accepted file
        let outcome: Result<Option<String>> = match item.entry {
            Ok(InboxEntry::Request(request)) => pool.submit(request).map(|id| {
                info!("Inbox {}: submitted as job {}", item.path.display(), id);
                summary.submitted += 1;
                None
            }),
            Ok(InboxEntry::Batch(requests)) => submit_batch(pool, &item.path, requests, &mut summary),
            Ok(InboxEntry::Command(command)) => run_command(pool, &command).map(|_| {
                summary.commands += 1;
                None
            }),
            Err(reason) => Err(PipelineError::Validation(reason)),
        };

        match outcome {
            Ok(notes) => {
                let target = mark_submitted(&item.path)?;
                if let Some(notes) = notes {
                    write_why_txt(&target, &notes)?;
                }
            }
            Err(PipelineError::QueueFull(capacity)) => {
                debug!("Queue full ({}), leaving {} for later", capacity, item.path.display());
                summary.deferred += 1;
            }
            Err(e) => {
                warn!("Inbox {}: rejected: {}", item.path.display(), e);
                mark_rejected(&item.path, &e.to_string())?;
                summary.rejected += 1;
            }
        }
    }

    if summary != InboxSummary::default() {
        info!(
            "Inbox: {} submitted, {} commands, {} rejected, {} deferred",
            summary.submitted, summary.commands, summary.rejected, summary.deferred
        );
    }
    Ok(summary)
}

/// Queue a batch file; returns the reasons for any refused entries.
/// A batch with nothing accepted is rejected as a whole.
fn submit_batch(
    pool: &WorkerPool,
    path: &Path,
    requests: Vec<JobRequest>,
    summary: &mut InboxSummary,
) -> Result<Option<String>> {
    let outcome = pool.submit_batch(requests)?;
    let reasons = outcome
        .rejected
        .iter()
        .map(|(position, reason)| format!("entry {}: {}", position, reason))
        .collect::<Vec<_>>()
        .join("\n");
    if outcome.job_ids.is_empty() {
        return Err(PipelineError::Validation(reasons));
    }

    info!(
        "Inbox {}: batch submitted as {}",
        path.display(),
        outcome.job_ids.join(", ")
    );
    summary.submitted += outcome.job_ids.len();
    summary.rejected += outcome.rejected.len();
    Ok((!outcome.rejected.is_empty()).then_some(reasons))
}

fn run_command(pool: &WorkerPool, command: &InboxCommand) -> Result<()> {
    match command {
        InboxCommand::Cancel { job_id } => pool.pipeline().cancel_job(job_id).map(|_| ()),
        InboxCommand::Delete { job_id } => pool.pipeline().delete_job(job_id).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::IdentityModel;
    use crate::testing::{FakeTts, Fixture};
    use std::sync::Arc;

    #[test]
    fn test_entries_parse() {
        let cmd: InboxEntry = serde_json::from_str(r#"{"action": "cancel", "job_id": "job_1"}"#).unwrap();
        assert_eq!(
            cmd,
            InboxEntry::Command(InboxCommand::Cancel {
                job_id: "job_1".to_string()
            })
        );

        let req: InboxEntry =
            serde_json::from_str(r#"{"script": "Hi", "avatar_id": "a1", "settings": {"enhance_quality": true}}"#)
                .unwrap();
        match req {
            InboxEntry::Request(r) => {
                assert_eq!(r.avatar_id, "a1");
                assert!(r.settings.enhance_quality);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_collect_and_mark() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.json"), r#"{"script": "Hi", "avatar_id": "a1"}"#).unwrap();
        fs::write(dir.path().join("a.json"), "{ broken").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let items = collect_requests(dir.path()).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].path.ends_with("a.json") && items[0].entry.is_err());
        assert!(items[1].entry.is_ok());

        let rejected = mark_rejected(&items[0].path, "bad json").unwrap();
        assert_eq!(rejected, dir.path().join("a.rejected"));
        assert_eq!(fs::read_to_string(dir.path().join("a.why.txt")).unwrap(), "bad json");
        assert_eq!(mark_submitted(&items[1].path).unwrap(), dir.path().join("b.submitted"));
        assert!(collect_requests(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_inbox_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = dir.path().join("inbox");
        assert!(collect_requests(&inbox).unwrap().is_empty());
        assert!(inbox.is_dir());
    }

    #[tokio::test]
    async fn test_process_inbox_submits_and_rejects() {
        let fx = Fixture::new(None, |_| {});
        let pool = WorkerPool::start(Arc::new(fx.pipeline(Arc::new(FakeTts::speech()), Arc::new(IdentityModel))));
        let inbox = &fx.config.inbox_dir;

        let good = serde_json::json!({"script": "Welcome!", "avatar_id": fx.avatar_id});
        fs::write(inbox.join("good.json"), good.to_string()).unwrap();
        fs::write(inbox.join("unknown.json"), r#"{"script": "Hi", "avatar_id": "nobody"}"#).unwrap();
        fs::write(inbox.join("stray.json"), r#"{"action": "cancel", "job_id": "job_missing"}"#).unwrap();

        let summary = process_inbox(inbox, &pool).unwrap();
        assert_eq!(summary.submitted, 1);
        assert_eq!(summary.rejected, 2);
        assert!(inbox.join("good.submitted").exists());
        let why = fs::read_to_string(inbox.join("unknown.why.txt")).unwrap();
        assert!(why.contains("avatar not found"));
        assert_eq!(fx.registry.len(), 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_file_submits_each_entry() {
        let fx = Fixture::new(None, |_| {});
        let pool = WorkerPool::start(Arc::new(fx.pipeline(Arc::new(FakeTts::speech()), Arc::new(IdentityModel))));
        let inbox = &fx.config.inbox_dir;

        let batch = serde_json::json!([
            {"script": "First take.", "avatar_id": fx.avatar_id},
            {"script": "Second take.", "avatar_id": fx.avatar_id, "voice_id": "narrator"},
            {"script": "Lost.", "avatar_id": "nobody"},
        ]);
        fs::write(inbox.join("campaign.json"), batch.to_string()).unwrap();
        fs::write(inbox.join("empty.json"), "[]").unwrap();

        let summary = process_inbox(inbox, &pool).unwrap();
        assert_eq!(summary.submitted, 2);
        assert_eq!(summary.rejected, 2);
        assert_eq!(fx.registry.len(), 2);
        assert!(inbox.join("campaign.submitted").exists());
        let why = fs::read_to_string(inbox.join("campaign.why.txt")).unwrap();
        assert!(why.starts_with("entry 2: avatar not found"));
        assert!(inbox.join("empty.rejected").exists());

        pool.shutdown().await;
    }
}
