//! Append-only JSON-lines journal backing the tunnel registry
//!
//! Each line is one [`JournalEntry`]. Entries are buffered in memory as the
//! registry mutates and written out by [`JournalWriter`] on flush; when the file
//! holds many more lines than live entries it is rewritten as a fresh snapshot.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;
use crate::tunnel::TunnelRecord;

/// Never compact below this many lines
const COMPACTION_FLOOR: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    Put { tunnel: TunnelRecord },
    Remove { route: String },
}

/// File-side state, serialized behind one lock so flushes never interleave
#[derive(Debug)]
pub struct JournalWriter {
    path: PathBuf,
    lines: usize,
}

impl JournalWriter {
    /// Whether appending `pending` more lines should turn into a compaction
    pub fn needs_compaction(&self, pending: usize, live: usize) -> bool {
        self.lines + pending > COMPACTION_FLOOR.max(live * 2)
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn append(&mut self, entries: &[JournalEntry]) -> Result<(), ServerError> {
        if entries.is_empty() {
            return Ok(());
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| persistence(&self.path, e))?;
        let mut out = BufWriter::new(file);
        write_entries(&mut out, entries).map_err(|e| persistence(&self.path, e))?;
        out.flush().map_err(|e| persistence(&self.path, e))?;

        self.lines += entries.len();
        Ok(())
    }

    /// Replace the file with one `put` line per record
    pub fn compact(&mut self, records: &[TunnelRecord]) -> Result<(), ServerError> {
        let tmp = self.path.with_extension("tmp");
        let entries: Vec<JournalEntry> = records
            .iter()
            .map(|record| JournalEntry::Put {
                tunnel: record.clone(),
            })
            .collect();

        {
            let file = File::create(&tmp).map_err(|e| persistence(&tmp, e))?;
            let mut out = BufWriter::new(file);
            write_entries(&mut out, &entries).map_err(|e| persistence(&tmp, e))?;
            let file = out
                .into_inner()
                .map_err(|e| persistence(&tmp, e.into_error()))?;
            file.sync_all().map_err(|e| persistence(&tmp, e))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| persistence(&self.path, e))?;

        tracing::debug!(path = %self.path.display(), entries = entries.len(), "Compacted tunnel journal");
        self.lines = entries.len();
        Ok(())
    }
}

#[derive(Debug)]
pub struct Journal {
    pending: Mutex<Vec<JournalEntry>>,
    writer: Mutex<JournalWriter>,
}

impl Journal {
    /// Open the journal at `path`, replaying whatever it holds
    ///
    /// Returns the surviving records ordered by creation time. Unparseable lines
    /// (typically a final line cut short by a crash) are skipped.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<TunnelRecord>), ServerError> {
        let path = path.into();
        let (records, lines) = if path.exists() {
            replay(&path)?
        } else {
            (Vec::new(), 0)
        };

        let journal = Self {
            pending: Mutex::new(Vec::new()),
            writer: Mutex::new(JournalWriter { path, lines }),
        };
        Ok((journal, records))
    }

    pub fn path(&self) -> PathBuf {
        self.writer.lock().path.clone()
    }

    /// Buffer an entry for the next flush
    pub fn record(&self, entry: JournalEntry) {
        self.pending.lock().push(entry);
    }

    pub fn take_pending(&self) -> Vec<JournalEntry> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Lock the file side; held for the duration of a flush
    pub fn writer(&self) -> MutexGuard<'_, JournalWriter> {
        self.writer.lock()
    }
}

fn replay(path: &Path) -> Result<(Vec<TunnelRecord>, usize), ServerError> {
    let file = File::open(path).map_err(|e| persistence(path, e))?;
    let reader = BufReader::new(file);

    let mut live: HashMap<String, TunnelRecord> = HashMap::new();
    let mut lines = 0;
    let mut skipped = 0;

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| persistence(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;

        match serde_json::from_str::<JournalEntry>(&line) {
            Ok(JournalEntry::Put { tunnel }) => {
                live.insert(tunnel.route.clone(), tunnel);
            }
            Ok(JournalEntry::Remove { route }) => {
                live.remove(&route);
            }
            Err(e) => {
                skipped += 1;
                tracing::warn!(
                    path = %path.display(),
                    line = index + 1,
                    "Skipping unreadable journal line: {}",
                    e
                );
            }
        }
    }

    let mut records: Vec<TunnelRecord> = live.into_values().collect();
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.route.cmp(&b.route))
    });

    tracing::info!(
        path = %path.display(),
        restored = records.len(),
        skipped,
        "Replayed tunnel journal"
    );
    Ok((records, lines))
}

fn write_entries(out: &mut impl Write, entries: &[JournalEntry]) -> std::io::Result<()> {
    for entry in entries {
        serde_json::to_writer(&mut *out, entry)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

fn persistence(path: &Path, err: impl std::fmt::Display) -> ServerError {
    ServerError::Persistence(format!("{}: {}", path.display(), err))
}
