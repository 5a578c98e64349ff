//! The deps log: a binary append-only record of dependencies discovered at
//! build time (header files reported by compilers), so later builds don't
//! need to re-read depfiles to know what to check.
//!
//! Wire format: an ASCII magic line and a little-endian version word,
//! followed by records.  Each record starts with a 32-bit size whose top bit
//! distinguishes the two kinds:
//!
//! - path record: the path's bytes, NUL-padded to a 4-byte boundary,
//!   followed by the bitwise complement of the path's implicit id (ids count
//!   up from 0 in record order);
//! - deps record: the output's id, the output's mtime as a 64-bit stamp,
//!   then the ids of the discovered inputs.
//!
//! A truncated or corrupt tail is cut off at the last valid record boundary
//! and loading succeeds with the readable prefix.

use crate::disk::TimeStamp;
use crate::graph::{DepsKind, NodeId, State};
use anyhow::{anyhow, bail};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;

const FILE_SIGNATURE: &[u8] = b"# ninjadeps\n";
const CURRENT_VERSION: u32 = 4;

/// Records larger than this are rejected at write time and treated as
/// corruption at load time.
const MAX_RECORD_SIZE: usize = (1 << 18) - 1;

const MIN_COMPACTION_ENTRY_COUNT: usize = 1000;
const COMPACTION_RATIO: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepsEntry {
    pub mtime: TimeStamp,
    pub inputs: Vec<NodeId>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LoadStatus {
    NotFound,
    Success,
}

#[derive(Default)]
pub struct DepsLog {
    /// Log id -> graph node, in path-record order.
    nodes: Vec<NodeId>,
    /// Graph node -> log id.
    ids: HashMap<NodeId, usize>,
    /// Deps entries indexed by the output's log id; None for nodes that are
    /// only mentioned as inputs.
    deps: Vec<Option<DepsEntry>>,
    file: Option<File>,
    write_path: Option<String>,
    needs_recompaction: bool,
}

impl DepsLog {
    pub fn new() -> Self {
        DepsLog::default()
    }

    pub fn needs_recompaction(&self) -> bool {
        self.needs_recompaction
    }

    /// Number of path records seen; every id is below this.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get_deps(&self, node: NodeId) -> Option<&DepsEntry> {
        let id = *self.ids.get(&node)?;
        self.deps.get(id)?.as_ref()
    }

    /// Load the log, creating graph nodes for recorded paths as needed.
    pub fn load(&mut self, path: &str, state: &mut State) -> anyhow::Result<LoadStatus> {
        let buf = match std::fs::read(path) {
            Ok(buf) => buf,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadStatus::NotFound);
            }
            Err(err) => return Err(anyhow!("read {}: {}", path, err)),
        };

        let valid_header = buf.len() >= FILE_SIGNATURE.len() + 4
            && &buf[..FILE_SIGNATURE.len()] == FILE_SIGNATURE
            && read_u32(&buf, FILE_SIGNATURE.len()) == CURRENT_VERSION;
        if !valid_header {
            // Unreadable signature or version: start over.  An empty deps
            // log only costs re-discovery on the next build.
            let _ = std::fs::remove_file(path);
            return Ok(LoadStatus::Success);
        }

        let mut total_entry_count = 0usize;
        let mut unique_entry_count = 0usize;
        let mut ofs = FILE_SIGNATURE.len() + 4;
        let mut read_failed = false;

        loop {
            let record_start = ofs;
            if ofs + 4 > buf.len() {
                read_failed = ofs != buf.len();
                break;
            }
            let header = read_u32(&buf, ofs);
            let is_deps = (header >> 31) != 0;
            let size = (header & 0x7fff_ffff) as usize;
            ofs += 4;
            if size > MAX_RECORD_SIZE || ofs + size > buf.len() {
                read_failed = true;
                ofs = record_start;
                break;
            }
            let payload = &buf[ofs..ofs + size];

            if is_deps {
                if size % 4 != 0 || size < 12 {
                    read_failed = true;
                    ofs = record_start;
                    break;
                }
                let out_id = read_u32(payload, 0) as usize;
                let mtime = TimeStamp(read_i64(payload, 4));
                let mut inputs = Vec::with_capacity((size - 12) / 4);
                let mut ok = out_id < self.nodes.len();
                for i in (12..size).step_by(4) {
                    let dep_id = read_u32(payload, i) as usize;
                    if dep_id >= self.nodes.len() {
                        ok = false;
                        break;
                    }
                    inputs.push(self.nodes[dep_id]);
                }
                if !ok {
                    read_failed = true;
                    ofs = record_start;
                    break;
                }
                total_entry_count += 1;
                if self.update_deps(out_id, DepsEntry { mtime, inputs }) {
                    unique_entry_count += 1;
                }
            } else {
                if size < 4 {
                    read_failed = true;
                    ofs = record_start;
                    break;
                }
                let mut path_len = size - 4;
                // Trim the NUL padding (at most 3 bytes).
                let mut padding = 3;
                while padding > 0 && path_len > 0 && payload[path_len - 1] == 0 {
                    path_len -= 1;
                    padding -= 1;
                }
                let id = self.nodes.len();
                let checksum = read_u32(payload, size - 4);
                if checksum != !(id as u32) || path_len == 0 {
                    read_failed = true;
                    ofs = record_start;
                    break;
                }
                let path_str = String::from_utf8_lossy(&payload[..path_len]).into_owned();
                let node = state.get_node(path_str);
                self.ids.insert(node, id);
                self.nodes.push(node);
            }
            ofs += size;
        }

        if read_failed {
            // Recover by truncating to the last fully-read record.
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|err| anyhow!("open {}: {}", path, err))?;
            file.set_len(ofs as u64)
                .map_err(|err| anyhow!("truncate {}: {}", path, err))?;
        }

        if total_entry_count > MIN_COMPACTION_ENTRY_COUNT
            && total_entry_count > unique_entry_count * COMPACTION_RATIO
        {
            self.needs_recompaction = true;
        }

        Ok(LoadStatus::Success)
    }

    /// Record into the in-memory table; true if the entry is new or changed.
    fn update_deps(&mut self, id: usize, entry: DepsEntry) -> bool {
        if id >= self.deps.len() {
            self.deps.resize(id + 1, None);
        }
        let slot = &mut self.deps[id];
        let fresh = match slot {
            Some(existing) => *existing != entry,
            None => true,
        };
        *slot = Some(entry);
        fresh
    }

    pub fn open_for_write(&mut self, path: &str) -> anyhow::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| anyhow!("open {}: {}", path, err))?;
        if file
            .metadata()
            .map_err(|err| anyhow!("stat {}: {}", path, err))?
            .len()
            == 0
        {
            file.write_all(FILE_SIGNATURE)?;
            file.write_all(&CURRENT_VERSION.to_le_bytes())?;
            file.flush()?;
        }
        self.file = Some(file);
        self.write_path = Some(path.to_owned());
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    /// Ensure a path record exists for the node, assigning the next id.
    fn record_id(&mut self, state: &State, node: NodeId) -> anyhow::Result<usize> {
        if let Some(&id) = self.ids.get(&node) {
            return Ok(id);
        }
        let path = state.node_path(node);
        if path.is_empty() {
            bail!("empty path in deps log");
        }
        let padding = (4 - path.len() % 4) % 4;
        let size = path.len() + padding + 4;
        if size > MAX_RECORD_SIZE {
            bail!("path too long for deps log: {}", path);
        }
        let id = self.nodes.len();
        if let Some(file) = &mut self.file {
            file.write_all(&(size as u32).to_le_bytes())?;
            file.write_all(path.as_bytes())?;
            file.write_all(&b"\0\0\0"[..padding])?;
            file.write_all(&(!(id as u32)).to_le_bytes())?;
        }
        self.ids.insert(node, id);
        self.nodes.push(node);
        Ok(id)
    }

    /// Record discovered deps for an output, appending to the log unless the
    /// stored entry is already identical.
    pub fn record_deps(
        &mut self,
        state: &State,
        output: NodeId,
        mtime: TimeStamp,
        inputs: &[NodeId],
    ) -> anyhow::Result<()> {
        let out_id = self.record_id(state, output)?;
        let mut input_ids = Vec::with_capacity(inputs.len());
        for &input in inputs {
            input_ids.push(self.record_id(state, input)?);
        }

        let entry = DepsEntry {
            mtime,
            inputs: inputs.to_vec(),
        };
        if self.deps.get(out_id).and_then(|d| d.as_ref()) == Some(&entry) {
            return Ok(());
        }

        let size = 4 + 8 + 4 * input_ids.len();
        if size > MAX_RECORD_SIZE {
            bail!("too many dependencies for deps log");
        }
        if let Some(file) = &mut self.file {
            file.write_all(&((size as u32) | 0x8000_0000).to_le_bytes())?;
            file.write_all(&(out_id as u32).to_le_bytes())?;
            file.write_all(&mtime.0.to_le_bytes())?;
            for id in &input_ids {
                file.write_all(&(*id as u32).to_le_bytes())?;
            }
            file.flush()?;
        }
        self.update_deps(out_id, entry);
        Ok(())
    }

    /// Rewrite the log keeping only entries for outputs still produced by a
    /// deps-discovering edge, renumbering ids densely.
    pub fn recompact(&mut self, path: &str, state: &State) -> anyhow::Result<()> {
        self.close();
        let temp_path = format!("{}.recompact", path);
        // Clear the way in case an earlier recompaction crashed midway.
        let _ = std::fs::remove_file(&temp_path);

        let mut new_log = DepsLog::new();
        new_log.open_for_write(&temp_path)?;
        for (id, node) in self.nodes.iter().enumerate() {
            let entry = match self.deps.get(id).and_then(|d| d.as_ref()) {
                Some(entry) => entry,
                None => continue,
            };
            if !is_deps_entry_live(state, *node) {
                continue;
            }
            new_log.record_deps(state, *node, entry.mtime, &entry.inputs)?;
        }
        new_log.close();

        std::fs::rename(&temp_path, path)
            .map_err(|err| anyhow!("rename {}: {}", temp_path, err))?;

        self.nodes = new_log.nodes;
        self.ids = new_log.ids;
        self.deps = new_log.deps;
        self.needs_recompaction = false;
        Ok(())
    }
}

/// A deps entry is worth keeping while its output is still produced by an
/// edge that performs dependency discovery.
fn is_deps_entry_live(state: &State, node: NodeId) -> bool {
    match state.nodes.get(node).in_edge {
        Some(edge) => state.edges.get(edge).deps != DepsKind::None,
        None => false,
    }
}

fn read_u32(buf: &[u8], ofs: usize) -> u32 {
    u32::from_le_bytes(buf[ofs..ofs + 4].try_into().unwrap())
}

fn read_i64(buf: &[u8], ofs: usize) -> i64 {
    i64::from_le_bytes(buf[ofs..ofs + 8].try_into().unwrap())
}
