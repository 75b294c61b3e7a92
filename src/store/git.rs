use crate::error::StoreError;
use crate::store::{
    AppendOnlyRemoteLog, AppendPayload, CommitIdentity, LogWorkspace, StoredRecord,
    collect_records,
};
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

/// Remote log backed by a git repository. The repository's own
/// non-fast-forward rejection on push is reused as the concurrency
/// primitive; no lock service is involved.
pub struct GitRemoteLog {
    remote: String,
    branch: String,
}

impl GitRemoteLog {
    pub fn new(remote: &str, branch: &str) -> Self {
        Self {
            remote: remote.to_string(),
            branch: branch.to_string(),
        }
    }

    fn clone_working_copy(&self) -> Result<TempDir, StoreError> {
        let dir = tempfile::Builder::new()
            .prefix("opslog-telemetry-")
            .tempdir()?;
        let status = Command::new("git")
            .args(["clone", "--quiet", "--branch", &self.branch, &self.remote])
            .arg(dir.path())
            .output()?;
        if !status.status.success() {
            return Err(StoreError::Unavailable(format!(
                "git clone {}: {}",
                self.remote,
                String::from_utf8_lossy(&status.stderr).trim()
            )));
        }
        Ok(dir)
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String, StoreError> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    if !output.status.success() {
        return Err(StoreError::Unavailable(format!(
            "git {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn push_rejected_by_remote_advance(stderr: &str) -> bool {
    stderr.contains("[rejected]")
        || stderr.contains("non-fast-forward")
        || stderr.contains("fetch first")
}

impl AppendOnlyRemoteLog for GitRemoteLog {
    fn checkout(&self) -> Result<Box<dyn LogWorkspace>, StoreError> {
        // Scoped acquisition: the TempDir removes the working copy on drop,
        // on every exit path.
        let dir = self.clone_working_copy()?;
        Ok(Box::new(GitWorkspace {
            dir,
            branch: self.branch.clone(),
        }))
    }

    fn list(&self, repo: &str) -> Result<Vec<StoredRecord>, StoreError> {
        let dir = self.clone_working_copy()?;
        collect_records(dir.path(), repo)
    }
}

struct GitWorkspace {
    dir: TempDir,
    branch: String,
}

impl LogWorkspace for GitWorkspace {
    fn stage_append(
        &mut self,
        rel_path: &Path,
        payload: &AppendPayload,
    ) -> Result<(), StoreError> {
        let target = self.dir.path().join(rel_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match payload {
            AppendPayload::Document(doc) => {
                if target.exists() {
                    let existing = std::fs::read_to_string(&target)?;
                    if existing.trim_end() != doc.trim_end() {
                        return Err(StoreError::AppendOnlyViolation(rel_path.to_path_buf()));
                    }
                } else {
                    std::fs::write(&target, format!("{doc}\n"))?;
                }
            }
            AppendPayload::Line(line) => {
                use std::io::Write;
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&target)?;
                writeln!(file, "{line}")?;
            }
        }
        let rel = rel_path.to_string_lossy();
        run_git(self.dir.path(), &["add", rel.as_ref()])?;
        Ok(())
    }

    fn commit(&mut self, message: &str, identity: &CommitIdentity) -> Result<(), StoreError> {
        // Identity is configured per working copy, never globally.
        run_git(self.dir.path(), &["config", "user.name", &identity.name])?;
        run_git(self.dir.path(), &["config", "user.email", &identity.email])?;
        run_git(self.dir.path(), &["commit", "--quiet", "-m", message])?;
        Ok(())
    }

    fn publish(&mut self) -> Result<(), StoreError> {
        let output = Command::new("git")
            .args(["push", "--quiet", "origin", &self.branch])
            .current_dir(self.dir.path())
            .output()?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if push_rejected_by_remote_advance(&stderr) {
            return Err(StoreError::Conflict);
        }
        Err(StoreError::Unavailable(format!(
            "git push origin {}: {}",
            self.branch,
            stderr.trim()
        )))
    }

    fn resync(&mut self) -> Result<(), StoreError> {
        // Forward merge only: fetch the advanced remote and rebase the
        // local append onto it. A destructive reset could silently drop a
        // concurrent writer's already-published append.
        run_git(self.dir.path(), &["fetch", "--quiet", "origin", &self.branch])?;
        let upstream = format!("origin/{}", self.branch);
        let rebase = Command::new("git")
            .args(["rebase", "--quiet", &upstream])
            .current_dir(self.dir.path())
            .output()?;
        if rebase.status.success() {
            return Ok(());
        }
        // Same-region append collision (flat layout); leave the tree clean
        // and report a conflict so the bounded retry loop decides.
        let _ = Command::new("git")
            .args(["rebase", "--abort"])
            .current_dir(self.dir.path())
            .output();
        Err(StoreError::Conflict)
    }
}
