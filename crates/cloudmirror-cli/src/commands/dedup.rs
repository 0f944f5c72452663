//! `cloudmirror remove-duplicates`
//!
//! Interactive by default: each hash-confirmed group is listed on stderr and
//! the operator types the indexes of the copies to delete. `--unsafe-auto`
//! keeps the oldest copy of every group without asking.

use std::collections::BTreeSet;
use std::io::BufRead;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Args;
use cloudmirror_core::domain::{FileId, ProviderId};
use cloudmirror_core::ports::DuplicateGroup;
use cloudmirror_sync::{operations, DuplicateChooser, OldestWins};

use super::{format_bytes, GlobalOptions, Session};

#[derive(Debug, Args)]
pub struct RemoveDuplicatesCommand {
    /// Only look for duplicates within this provider
    #[arg(long)]
    pub provider: Option<String>,

    /// Keep the oldest copy of each group without prompting
    #[arg(long)]
    pub unsafe_auto: bool,
}

impl RemoveDuplicatesCommand {
    pub async fn execute(&self, options: &GlobalOptions) -> Result<ExitCode> {
        let provider = self.provider.as_deref().map(ProviderId::new).transpose()?;
        let session = Session::open(options).await?;

        let chooser: Box<dyn DuplicateChooser> = if self.unsafe_auto {
            Box::new(OldestWins)
        } else {
            Box::new(PromptChooser)
        };

        let outcome =
            operations::remove_duplicates(&session.ctx, provider.as_ref(), &*chooser).await?;
        session.finish(&outcome, |report| {
            session.print_actions(&report.actions);
            session.formatter.success(&format!(
                "{} duplicate group(s): {} file(s) removed ({} deleted, {} trashed)",
                report.groups, report.files_removed, report.replicas_deleted, report.replicas_trashed
            ));
            if report.ambiguous_groups > 0 {
                session.formatter.warn(&format!(
                    "{} group(s) skipped because their content could not be confirmed identical",
                    report.ambiguous_groups
                ));
            }
        })
    }
}

/// Asks the operator on stdin which members to delete
struct PromptChooser;

#[async_trait]
impl DuplicateChooser for PromptChooser {
    async fn choose(&self, group: &DuplicateGroup) -> Result<Vec<FileId>> {
        eprintln!("{}", render_group(group));
        eprint!("Indexes to delete (comma-separated, empty keeps all): ");

        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await?
        .context("Failed to read selection")?;

        let picked = parse_selection(&line, group.members.len())?;
        Ok(picked
            .into_iter()
            .map(|index| group.members[index].file.id.clone())
            .collect())
    }
}

fn render_group(group: &DuplicateGroup) -> String {
    let mut out = format!(
        "Duplicates of {} on {}:",
        group.calculated_id, group.provider
    );
    for (index, member) in group.members.iter().enumerate() {
        let accounts: BTreeSet<String> = member
            .replicas
            .iter()
            .map(|r| r.account_id.to_string())
            .collect();
        out.push_str(&format!(
            "\n  [{index}] {}  {}  {}  ({})",
            member.file.path,
            format_bytes(member.file.size),
            member.file.mod_time.format("%Y-%m-%d %H:%M:%S UTC"),
            accounts.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }
    out
}

/// Parse `"0, 2"` into distinct member indexes below `count`
fn parse_selection(input: &str, count: usize) -> Result<Vec<usize>> {
    let mut picked = BTreeSet::new();
    for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let index: usize = part
            .parse()
            .with_context(|| format!("invalid index '{part}'"))?;
        if index >= count {
            bail!("index {index} out of range (0..{count})");
        }
        picked.insert(index);
    }
    Ok(picked.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use cloudmirror_core::domain::{CalculatedId, File, LogicalPath};
    use cloudmirror_core::ports::DuplicateCandidate;

    #[test]
    fn test_parse_selection_empty_keeps_all() {
        assert!(parse_selection("\n", 3).unwrap().is_empty());
        assert!(parse_selection("  ", 3).unwrap().is_empty());
    }

    #[test]
    fn test_parse_selection_dedupes_and_sorts() {
        assert_eq!(parse_selection("2, 0,2\n", 3).unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_parse_selection_rejects_bad_input() {
        assert!(parse_selection("1,x", 3).is_err());
        assert!(parse_selection("3", 3).is_err());
        assert!(parse_selection("-1", 3).is_err());
    }

    #[test]
    fn test_render_group_lists_members() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let file = |p: &str| File::new(LogicalPath::new(p).unwrap(), 2048, at);
        let group = DuplicateGroup {
            provider: ProviderId::new("google").unwrap(),
            calculated_id: CalculatedId::from_parts("x.txt", 2048),
            members: vec![
                DuplicateCandidate {
                    file: file("a/x.txt"),
                    replicas: Vec::new(),
                },
                DuplicateCandidate {
                    file: file("b/x.txt"),
                    replicas: Vec::new(),
                },
            ],
        };

        let text = render_group(&group);
        assert!(text.starts_with("Duplicates of x.txt2048 on google:"));
        assert!(text.contains("[0] a/x.txt  2.0 KiB  2024-05-01 12:00:00 UTC"));
        assert!(text.contains("[1] b/x.txt"));
    }
}
