//! On-disk record of unfinished tasks.
//!
//! A background [`crate::HttpTransport`] writes every task it creates here
//! and removes it on completion. Whatever is left when the process dies is
//! restored and resumed by the next process. Credential headers are
//! stripped before anything is written, and on unix the file is readable by
//! its owner only.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use porter_types::TaskId;

use crate::transport::TaskDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: TaskId,
    pub descriptor: TaskDescriptor,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalFile {
    tasks: Vec<JournalEntry>,
}

pub struct TaskJournal {
    path: PathBuf,
    entries: Mutex<BTreeMap<TaskId, JournalEntry>>,
}

impl TaskJournal {
    /// Load the journal at `path`, starting empty if it does not exist.
    ///
    /// An unreadable journal is logged and replaced rather than failing
    /// startup.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let entries = match std::fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<JournalFile>(&raw) {
                Ok(file) => file.tasks.into_iter().map(|e| (e.id, e)).collect(),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "task journal is corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err),
        };
        debug!(path = %path.display(), tasks = entries.len(), "task journal opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn record(&self, id: TaskId, descriptor: &TaskDescriptor) -> io::Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            id,
            JournalEntry {
                id,
                descriptor: descriptor.without_credentials(),
            },
        );
        self.persist(&entries)
    }

    pub fn update_description(&self, id: TaskId, description: Option<String>) -> io::Result<()> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.descriptor.description = description;
                self.persist(&entries)
            }
            None => Ok(()),
        }
    }

    pub fn forget(&self, id: TaskId) -> io::Result<()> {
        let mut entries = self.entries.lock();
        if entries.remove(&id).is_some() {
            self.persist(&entries)
        } else {
            Ok(())
        }
    }

    fn persist(&self, entries: &BTreeMap<TaskId, JournalEntry>) -> io::Result<()> {
        let file = JournalFile {
            tasks: entries.values().cloned().collect(),
        };
        let raw = serde_json::to_vec_pretty(&file)?;
        let tmp = self.path.with_extension("tmp");
        let mut out = owner_only().open(&tmp)?;
        out.write_all(&raw)?;
        out.sync_all()?;
        drop(out);
        std::fs::rename(&tmp, &self.path)
    }
}

fn owner_only() -> std::fs::OpenOptions {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UploadBody;

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");
        let descriptor = TaskDescriptor::upload(
            "https://content.example/2/files/upload_session/append_v2",
            UploadBody::range("/tmp/staged", 0, 1024),
        )
        .description(Some("0.3.0#?///?#{}".into()));

        let journal = TaskJournal::open(&path).unwrap();
        journal.record(TaskId(3), &descriptor).unwrap();
        journal.record(TaskId(4), &descriptor).unwrap();
        journal.forget(TaskId(3)).unwrap();
        journal.update_description(TaskId(4), None).unwrap();
        drop(journal);

        let reopened = TaskJournal::open(&path).unwrap();
        let entries = reopened.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, TaskId(4));
        assert_eq!(entries[0].descriptor.description, None);
        assert_eq!(entries[0].descriptor.body, descriptor.body);
    }

    #[test]
    fn credentials_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");
        let descriptor = TaskDescriptor::download("https://content.example/2/files/download")
            .header("Authorization", "Bearer SECRET-TOKEN-123")
            .header("Dropbox-API-Arg", r#"{"path":"/a.txt"}"#);

        let journal = TaskJournal::open(&path).unwrap();
        journal.record(TaskId(1), &descriptor).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("SECRET-TOKEN-123"));
        let entry = &journal.entries()[0];
        assert_eq!(entry.descriptor.header_value("Authorization"), None);
        assert!(entry.descriptor.header_value("Dropbox-API-Arg").is_some());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn corrupt_journal_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let journal = TaskJournal::open(&path).unwrap();
        assert!(journal.entries().is_empty());
    }
}
