//! Appends one markdown section per run to a loop's committed ledger file.

use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::domain::LoopRun;

/// Render one run as a markdown ledger section.
pub fn render_entry(run: &LoopRun, profile_name: &str) -> String {
    let heading = format!("## run-{}-{}", run.started_at.to_rfc3339(), profile_name);
    let exit_code = run
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string());
    format!(
        "{heading}\n\n- exit_code: {exit_code}\n- prompt_source: {:?}\n\n```\n{}\n```\n\n",
        run.prompt_source, run.output_tail
    )
}

/// Append a run's ledger entry to `path`, creating the file if absent.
pub fn append_entry(path: &Path, run: &LoopRun, profile_name: &str) -> std::io::Result<()> {
    debug!(?path, run_id = %run.id, "ledger::append_entry: called");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(render_entry(run, profile_name).as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PromptSource, RunStatus};

    #[test]
    fn render_entry_contains_exit_code_and_output() {
        let mut run = LoopRun::start("r1", "loop-1", None, PromptSource::Base);
        run.finish(RunStatus::Success, Some(0), "hello\n".to_string());
        let entry = render_entry(&run, "default");
        assert!(entry.contains("exit_code: 0"));
        assert!(entry.contains("hello"));
        assert!(entry.starts_with("## run-"));
    }

    #[test]
    fn append_entry_creates_parent_dirs_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledgers/demo.md");
        let mut run = LoopRun::start("r1", "loop-1", None, PromptSource::Base);
        run.finish(RunStatus::Success, Some(0), "first\n".to_string());
        append_entry(&path, &run, "default").unwrap();

        let mut run2 = LoopRun::start("r2", "loop-1", None, PromptSource::Base);
        run2.finish(RunStatus::Error, Some(1), "second\n".to_string());
        append_entry(&path, &run2, "default").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("first"));
        assert!(content.contains("second"));
    }
}
