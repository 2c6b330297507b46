//! Removable application list backed by a flat toggle file.
//!
//! Each application sits on its own line. A bare name keeps the application, a name
//! prefixed with `#` marks it for removal. Anything else in the file (blank lines,
//! prose comments) is carried through untouched.
use crate::error::{DebloatError, Result};
use crate::write_atomically;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const DEFAULT_APP_LIST_FILE: &str = "Win11Debloat/Appslist.txt";

static ENTRY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<disabled>#)?(?P<name>[A-Za-z0-9][A-Za-z0-9._-]*)(?:\s+#.*)?\s*$").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEntry {
    pub name: String,
    pub keep: bool,
}

#[derive(Debug, Clone)]
struct EntrySlot {
    entry: AppEntry,
    line: usize,
}

#[derive(Debug, Clone)]
pub struct AppListStore {
    path: PathBuf,
    /// Raw lines, terminators included, exactly as read.
    lines: Vec<String>,
    slots: Vec<EntrySlot>,
    index: HashMap<String, usize>,
}

impl AppListStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "app list not found");
                return Err(DebloatError::ResourceUnavailable { path });
            }
            Err(source) => {
                let err = DebloatError::ReadFailed { source, path };
                tracing::warn!(error = %err, "app list unreadable");
                return Err(err);
            }
        };

        let lines: Vec<String> = contents.split_inclusive('\n').map(str::to_string).collect();
        let mut slots = Vec::new();
        let mut index = HashMap::new();

        for (line_no, raw) in lines.iter().enumerate() {
            let Some(entry) = decode_entry(raw) else {
                continue;
            };
            if index.contains_key(&entry.name) {
                continue;
            }
            index.insert(entry.name.clone(), slots.len());
            slots.push(EntrySlot {
                entry,
                line: line_no,
            });
        }

        tracing::debug!(path = %path.display(), entries = slots.len(), "loaded app list");
        Ok(AppListStore {
            path,
            lines,
            slots,
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries in file order.
    pub fn entries(&self) -> impl Iterator<Item = &AppEntry> {
        self.slots.iter().map(|slot| &slot.entry)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn keep(&self, name: &str) -> Option<bool> {
        self.index.get(name).map(|&i| self.slots[i].entry.keep)
    }

    /// Flip the keep flag of `name` and rewrite the file. Returns the new flag.
    pub fn toggle(&mut self, name: &str) -> Result<bool> {
        let current = self
            .keep(name)
            .ok_or_else(|| DebloatError::UnknownEntry(name.to_string()))?;
        self.set_keep(name, !current)?;
        Ok(!current)
    }

    /// Set the keep flag of `name` and rewrite the file. On a failed write the
    /// in-memory flag is rolled back so memory and disk agree.
    pub fn set_keep(&mut self, name: &str, keep: bool) -> Result<()> {
        let slot = *self
            .index
            .get(name)
            .ok_or_else(|| DebloatError::UnknownEntry(name.to_string()))?;
        if self.slots[slot].entry.keep == keep {
            return Ok(());
        }

        let line = self.slots[slot].line;
        let rewritten = encode_entry(&self.lines[line], keep);
        let original = std::mem::replace(&mut self.lines[line], rewritten);
        self.slots[slot].entry.keep = keep;

        if let Err(err) = write_atomically(&self.path, self.lines.concat().as_bytes()) {
            self.lines[line] = original;
            self.slots[slot].entry.keep = !keep;
            let err = DebloatError::WriteFailed {
                source: err,
                path: self.path.clone(),
            };
            tracing::warn!(app = name, error = %err, "app list write failed, flag rolled back");
            return Err(err);
        }

        tracing::info!(app = name, keep, "app list entry updated");
        Ok(())
    }
}

fn split_terminator(raw: &str) -> (&str, &str) {
    if let Some(content) = raw.strip_suffix("\r\n") {
        (content, "\r\n")
    } else if let Some(content) = raw.strip_suffix('\n') {
        (content, "\n")
    } else {
        (raw, "")
    }
}

fn decode_entry(raw: &str) -> Option<AppEntry> {
    let (content, _) = split_terminator(raw);
    let caps = ENTRY_REGEX.captures(content)?;
    Some(AppEntry {
        name: caps["name"].to_string(),
        keep: caps.name("disabled").is_none(),
    })
}

fn encode_entry(raw: &str, keep: bool) -> String {
    let (content, terminator) = split_terminator(raw);
    let bare = content.strip_prefix('#').unwrap_or(content);
    if keep {
        format!("{bare}{terminator}")
    } else {
        format!("#{bare}{terminator}")
    }
}
