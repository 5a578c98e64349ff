//! The build log: an append-only record of every command this tool has run.
//!
//! Each run appends `start\tend\tmtime\toutput\tcommand_hash` lines to the
//! log file.  Loading runs through all entries in series, keeping only the
//! newest per output; once the number of redundant entries exceeds a
//! threshold, the file is rewritten and swapped into place.

use crate::disk::{DiskInterface, TimeStamp};
use crate::hash;
use anyhow::anyhow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};

const FILE_SIGNATURE: &str = "# ninja log v";
const CURRENT_VERSION: u32 = 5;
const OLDEST_SUPPORTED_VERSION: u32 = 4;

const MIN_COMPACTION_ENTRY_COUNT: usize = 100;
const COMPACTION_RATIO: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub output: String,
    pub command_hash: u64,
    pub start_ms: i32,
    pub end_ms: i32,
    pub mtime: TimeStamp,
}

impl LogEntry {
    pub fn duration_ms(&self) -> i32 {
        self.end_ms - self.start_ms
    }
}

/// Decides which log entries are garbage during recompaction; typically
/// "the path is produced by no current edge and is gone from disk".
pub trait BuildLogUser {
    fn is_path_dead(&self, path: &str) -> bool;
}

/// Keep everything; used by tools that must not drop entries.
pub struct KeepAllLogEntries;
impl BuildLogUser for KeepAllLogEntries {
    fn is_path_dead(&self, _path: &str) -> bool {
        false
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LoadStatus {
    NotFound,
    Success,
}

#[derive(Default)]
pub struct BuildLog {
    entries: HashMap<String, LogEntry>,
    file: Option<File>,
    /// Path to append to; the file itself is opened on first write.
    write_path: Option<String>,
    needs_recompaction: bool,
}

/// Parse a leading (optionally signed) integer, ignoring trailing garbage.
/// Mirrors the permissive numeric parsing the log format has always had.
fn int_prefix(s: &str) -> i64 {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s),
    };
    let mut val: i64 = 0;
    for b in digits.bytes() {
        match b {
            b'0'..=b'9' => val = val.wrapping_mul(10).wrapping_add((b - b'0') as i64),
            _ => break,
        }
    }
    sign * val
}

fn hex_prefix(s: &str) -> u64 {
    let mut val: u64 = 0;
    for b in s.bytes() {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => break,
        };
        val = val.wrapping_mul(16).wrapping_add(digit as u64);
    }
    val
}

impl BuildLog {
    pub fn new() -> Self {
        BuildLog::default()
    }

    pub fn lookup(&self, output: &str) -> Option<&LogEntry> {
        self.entries.get(output)
    }

    pub fn entries(&self) -> &HashMap<String, LogEntry> {
        &self.entries
    }

    pub fn needs_recompaction(&self) -> bool {
        self.needs_recompaction
    }

    /// Load entries from a log file, retaining the last record per output.
    /// A missing file reports `NotFound`; an unreadably old version deletes
    /// the file and loads empty, since an empty log merely causes rebuilds.
    pub fn load(&mut self, path: &str) -> anyhow::Result<LoadStatus> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadStatus::NotFound);
            }
            Err(err) => return Err(anyhow!("open {}: {}", path, err)),
        };

        let mut reader = BufReader::new(file);
        let mut log_version = 0u32;
        let mut total_entry_count = 0usize;
        let mut unique_entry_count = 0usize;
        let mut first_line = true;
        let mut line = Vec::new();

        loop {
            line.clear();
            let n = reader
                .read_until(b'\n', &mut line)
                .map_err(|err| anyhow!("read {}: {}", path, err))?;
            if n == 0 {
                break;
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            let text = String::from_utf8_lossy(&line);

            if first_line {
                first_line = false;
                if let Some(rest) = text.strip_prefix(FILE_SIGNATURE) {
                    log_version = int_prefix(rest) as u32;
                }
                if log_version < OLDEST_SUPPORTED_VERSION {
                    // Too old to read; start over.
                    drop(reader);
                    let _ = std::fs::remove_file(path);
                    return Ok(LoadStatus::Success);
                }
                continue;
            }

            // Skip any line without all four separators.
            let mut fields = text.splitn(5, '\t');
            let (start, end, mtime, output, hash_field) = match (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) {
                (Some(a), Some(b), Some(c), Some(d), Some(e)) => (a, b, c, d, e),
                _ => continue,
            };

            let command_hash = if log_version >= 5 {
                hex_prefix(hash_field)
            } else {
                // v4 stored the command text itself.
                hash::hash_command(hash_field)
            };

            total_entry_count += 1;
            let entry = LogEntry {
                output: output.to_owned(),
                command_hash,
                start_ms: int_prefix(start) as i32,
                end_ms: int_prefix(end) as i32,
                mtime: TimeStamp(int_prefix(mtime)),
            };
            if self.entries.insert(entry.output.clone(), entry).is_none() {
                unique_entry_count += 1;
            }
        }

        // Decide whether it's time to rebuild the log:
        // - if we're upgrading versions
        // - if it's getting large
        if !first_line {
            if log_version < CURRENT_VERSION {
                self.needs_recompaction = true;
            } else if total_entry_count > MIN_COMPACTION_ENTRY_COUNT
                && total_entry_count > unique_entry_count * COMPACTION_RATIO
            {
                self.needs_recompaction = true;
            }
        }

        Ok(LoadStatus::Success)
    }

    /// Prepare for appending; recompacts first when load decided to.
    /// The file itself is not opened until the first record.
    pub fn open_for_write(&mut self, path: &str, user: &dyn BuildLogUser) -> anyhow::Result<()> {
        if self.needs_recompaction {
            self.recompact(path, user)?;
            self.needs_recompaction = false;
        }
        self.write_path = Some(path.to_owned());
        Ok(())
    }

    fn open_if_needed(&mut self) -> anyhow::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let path = match &self.write_path {
            Some(path) => path,
            None => return Ok(()),
        };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| anyhow!("open {}: {}", path, err))?;
        if file.metadata().map_err(|err| anyhow!("stat {}: {}", path, err))?.len() == 0 {
            writeln!(file, "{}{}", FILE_SIGNATURE, CURRENT_VERSION)
                .map_err(|err| anyhow!("write {}: {}", path, err))?;
        }
        self.file = Some(file);
        Ok(())
    }

    fn write_entry(file: &mut dyn Write, entry: &LogEntry) -> std::io::Result<()> {
        writeln!(
            file,
            "{}\t{}\t{}\t{}\t{:x}",
            entry.start_ms, entry.end_ms, entry.mtime, entry.output, entry.command_hash
        )
    }

    /// Record a finished command for one output, updating the in-memory
    /// entry and appending to the log file.  Flushed per record so a crashed
    /// build loses at most the in-flight line.
    pub fn record(
        &mut self,
        output: &str,
        command_hash: u64,
        start_ms: i32,
        end_ms: i32,
        mtime: TimeStamp,
    ) -> anyhow::Result<()> {
        let entry = LogEntry {
            output: output.to_owned(),
            command_hash,
            start_ms,
            end_ms,
            mtime,
        };
        self.entries.insert(output.to_owned(), entry.clone());

        self.open_if_needed()?;
        if let Some(file) = &mut self.file {
            Self::write_entry(file, &entry)?;
            file.flush()?;
        }
        Ok(())
    }

    /// Create the file even if nothing has been recorded, then stop writing.
    pub fn close(&mut self) -> anyhow::Result<()> {
        self.open_if_needed()?;
        self.file = None;
        Ok(())
    }

    fn write_all_entries(
        &self,
        path: &str,
        mut keep: impl FnMut(&LogEntry) -> anyhow::Result<Option<LogEntry>>,
    ) -> anyhow::Result<()> {
        let mut file = File::create(path).map_err(|err| anyhow!("create {}: {}", path, err))?;
        writeln!(file, "{}{}", FILE_SIGNATURE, CURRENT_VERSION)?;
        // Sort for output determinism; the in-memory map has no useful order.
        let mut outputs: Vec<&String> = self.entries.keys().collect();
        outputs.sort();
        for output in outputs {
            if let Some(entry) = keep(&self.entries[output])? {
                Self::write_entry(&mut file, &entry)?;
            }
        }
        file.flush()?;
        Ok(())
    }

    /// Rewrite the log dropping entries the user reports dead, then swap the
    /// new file into place.
    pub fn recompact(&mut self, path: &str, user: &dyn BuildLogUser) -> anyhow::Result<()> {
        self.file = None;
        let temp_path = format!("{}.recompact", path);
        let mut dead_outputs = Vec::new();
        self.write_all_entries(&temp_path, |entry| {
            if user.is_path_dead(&entry.output) {
                dead_outputs.push(entry.output.clone());
                Ok(None)
            } else {
                Ok(Some(entry.clone()))
            }
        })?;
        for output in dead_outputs {
            self.entries.remove(&output);
        }
        std::fs::rename(&temp_path, path)
            .map_err(|err| anyhow!("rename {}: {}", temp_path, err))?;
        Ok(())
    }

    /// Rewrite the log with freshly statted mtimes for the outputs in the
    /// filter (all outputs when the filter is empty).
    pub fn restat(
        &mut self,
        path: &str,
        disk: &dyn DiskInterface,
        outputs: &[String],
    ) -> anyhow::Result<()> {
        self.file = None;
        let temp_path = format!("{}.restat", path);
        let mut updates: Vec<(String, TimeStamp)> = Vec::new();
        self.write_all_entries(&temp_path, |entry| {
            let mut entry = entry.clone();
            if outputs.is_empty() || outputs.iter().any(|o| *o == entry.output) {
                entry.mtime = disk.stat(&entry.output)?;
                updates.push((entry.output.clone(), entry.mtime));
            }
            Ok(Some(entry))
        })?;
        for (output, mtime) in updates {
            if let Some(entry) = self.entries.get_mut(&output) {
                entry.mtime = mtime;
            }
        }
        std::fs::rename(&temp_path, path)
            .map_err(|err| anyhow!("rename {}: {}", temp_path, err))?;
        Ok(())
    }
}
