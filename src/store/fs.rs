use crate::error::StoreError;
use crate::store::{
    AppendOnlyRemoteLog, AppendPayload, CommitIdentity, LogWorkspace, StoredRecord,
    collect_records,
};
use std::path::{Path, PathBuf};

const VERSION_FILE: &str = "VERSION";
const PUBLISHED_DIR: &str = "published";

/// Versioned local-directory store. The published tree lives under
/// `root/published/` and a monotonic stamp in `root/VERSION` plays the
/// role of the remote tip: publish is a compare-and-swap on the stamp, so
/// a stamp moved by another writer between checkout and publish surfaces
/// as a publish conflict exactly like a rejected push would.
///
/// Used by tests and local development; production deployments use the
/// git transport.
pub struct FsRemoteLog {
    root: PathBuf,
}

impl FsRemoteLog {
    /// Create the store layout if absent and open it.
    pub fn init(root: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root.join(PUBLISHED_DIR))?;
        let version = root.join(VERSION_FILE);
        if !version.exists() {
            std::fs::write(&version, "0\n")?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Open an existing store; missing layout is a backend configuration
    /// problem, not an empty log.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        if !root.join(VERSION_FILE).exists() {
            return Err(StoreError::Unavailable(format!(
                "no log store at {}",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn published_root(&self) -> PathBuf {
        self.root.join(PUBLISHED_DIR)
    }

    pub fn version(&self) -> Result<u64, StoreError> {
        read_version(&self.root)
    }

    /// Move the stamp without publishing anything, as a concurrent writer
    /// would. Test hook.
    pub fn bump_version(&self) -> Result<(), StoreError> {
        let next = read_version(&self.root)? + 1;
        std::fs::write(self.root.join(VERSION_FILE), format!("{next}\n"))?;
        Ok(())
    }
}

fn read_version(root: &Path) -> Result<u64, StoreError> {
    let raw = std::fs::read_to_string(root.join(VERSION_FILE))?;
    raw.trim()
        .parse::<u64>()
        .map_err(|e| StoreError::Unavailable(format!("corrupt version stamp: {e}")))
}

impl AppendOnlyRemoteLog for FsRemoteLog {
    fn checkout(&self) -> Result<Box<dyn LogWorkspace>, StoreError> {
        Ok(Box::new(FsWorkspace {
            root: self.root.clone(),
            base_version: read_version(&self.root)?,
            staged: Vec::new(),
            committed: false,
        }))
    }

    fn list(&self, repo: &str) -> Result<Vec<StoredRecord>, StoreError> {
        collect_records(&self.published_root(), repo)
    }
}

struct FsWorkspace {
    root: PathBuf,
    base_version: u64,
    staged: Vec<(PathBuf, AppendPayload)>,
    committed: bool,
}

impl LogWorkspace for FsWorkspace {
    fn stage_append(
        &mut self,
        rel_path: &Path,
        payload: &AppendPayload,
    ) -> Result<(), StoreError> {
        self.staged.push((rel_path.to_path_buf(), payload.clone()));
        Ok(())
    }

    fn commit(&mut self, _message: &str, _identity: &CommitIdentity) -> Result<(), StoreError> {
        if self.staged.is_empty() {
            return Err(StoreError::Unavailable("nothing staged to commit".into()));
        }
        self.committed = true;
        Ok(())
    }

    fn publish(&mut self) -> Result<(), StoreError> {
        if !self.committed {
            return Err(StoreError::Unavailable("publish before commit".into()));
        }
        if read_version(&self.root)? != self.base_version {
            return Err(StoreError::Conflict);
        }

        let published = self.root.join(PUBLISHED_DIR);
        for (rel, payload) in &self.staged {
            let target = published.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match payload {
                AppendPayload::Document(doc) => {
                    if target.exists() {
                        let existing = std::fs::read_to_string(&target)?;
                        if existing.trim_end() != doc.trim_end() {
                            return Err(StoreError::AppendOnlyViolation(rel.clone()));
                        }
                        // Replay of an already-published record.
                        continue;
                    }
                    std::fs::write(&target, format!("{doc}\n"))?;
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
        }

        std::fs::write(
            self.root.join(VERSION_FILE),
            format!("{}\n", self.base_version + 1),
        )?;
        Ok(())
    }

    fn resync(&mut self) -> Result<(), StoreError> {
        // Fetch: adopt the new remote tip. Rebase: the staged appends are
        // kept verbatim and replayed onto it at the next publish.
        self.base_version = read_version(&self.root)?;
        Ok(())
    }
}
