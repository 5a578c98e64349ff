//! The staleness engine: decides, for a target and everything reachable from
//! it, which edges must run.
//!
//! `recompute_dirty` walks the graph depth-first, stats files once each,
//! folds in recorded state from the build log and deps log, and leaves its
//! verdict in per-node status and per-edge `outputs_ready` flags.  Edge marks
//! double as DFS colors for cycle detection.

use crate::build_log::BuildLog;
use crate::canon::canon_path;
use crate::depfile;
use crate::deps_log::DepsLog;
use crate::disk::DiskInterface;
use crate::dyndep;
use crate::graph::{DepsKind, EdgeId, NodeId, State, VisitMark};
use crate::hash;
use crate::scanner::Scanner;
use anyhow::anyhow;
use std::path::Path;

/// Print the reason an edge is considered out of date (`-d explain`).
macro_rules! explain {
    ($scan:expr, $($fmt:tt)*) => {
        if $scan.explain {
            eprintln!("joist explain: {}", format_args!($($fmt)*));
        }
    };
}

pub struct DependencyScan<'a> {
    disk: &'a dyn DiskInterface,
    build_log: &'a BuildLog,
    deps_log: &'a DepsLog,
    explain: bool,
}

impl<'a> DependencyScan<'a> {
    pub fn new(
        disk: &'a dyn DiskInterface,
        build_log: &'a BuildLog,
        deps_log: &'a DepsLog,
        explain: bool,
    ) -> Self {
        DependencyScan {
            disk,
            build_log,
            deps_log,
            explain,
        }
    }

    /// Establish dirtiness for `node` and everything it transitively needs.
    /// Validation targets discovered along the way are appended to
    /// `validations`; they want building but don't gate their consumers.
    pub fn recompute_dirty(
        &self,
        state: &mut State,
        node: NodeId,
        validations: &mut Vec<NodeId>,
    ) -> anyhow::Result<()> {
        let mut stack = Vec::new();
        let mut queue = vec![node];
        while let Some(node) = queue.pop() {
            stack.clear();
            let mut new_validations = Vec::new();
            self.recompute_node_dirty(state, node, &mut stack, &mut new_validations)?;
            queue.extend(&new_validations);
            validations.extend(new_validations);
        }
        Ok(())
    }

    fn recompute_node_dirty(
        &self,
        state: &mut State,
        node: NodeId,
        stack: &mut Vec<NodeId>,
        validations: &mut Vec<NodeId>,
    ) -> anyhow::Result<()> {
        let edge_id = match state.nodes.get(node).in_edge {
            None => {
                // Source file: dirty only if it is missing.
                if state.nodes.get(node).status_known() {
                    return Ok(());
                }
                self.stat_if_necessary(state, node)?;
                let missing = !state.nodes.get(node).exists();
                if missing {
                    explain!(self, "{} has no in-edge and is missing", state.node_path(node));
                }
                state.nodes.get_mut(node).set_dirty(missing);
                return Ok(());
            }
            Some(edge) => edge,
        };

        match state.edges.get(edge_id).mark {
            VisitMark::Done => return Ok(()),
            VisitMark::InStack => return Err(self.cycle_error(state, edge_id, node, stack)),
            VisitMark::None => {}
        }
        state.edges.get_mut(edge_id).mark = VisitMark::InStack;
        stack.push(node);

        let mut dirty = false;
        {
            let edge = state.edges.get_mut(edge_id);
            edge.outputs_ready = true;
            edge.deps_missing = false;
        }

        if !state.edges.get(edge_id).deps_loaded {
            // First encounter with this edge: resolve a pending dyndep file
            // before anything reads this edge's input list.  If the file is
            // not buildable yet it stays pending and is loaded mid-build.
            if let Some(dd) = state.edges.get(edge_id).dyndep {
                if state.nodes.get(dd).dyndep_pending {
                    self.recompute_node_dirty(state, dd, stack, validations)?;
                    let dd_ready = match state.nodes.get(dd).in_edge {
                        None => true,
                        Some(producer) => state.edges.get(producer).outputs_ready,
                    };
                    if dd_ready {
                        dyndep::load_dyndeps(state, self.disk, dd)?;
                    }
                }
            }
        }

        let outputs = state.edges.get(edge_id).outputs.clone();
        for &output in &outputs {
            self.stat_if_necessary(state, output)?;
        }

        if !state.edges.get(edge_id).deps_loaded {
            state.edges.get_mut(edge_id).deps_loaded = true;
            if !self.load_deps(state, edge_id)? {
                // No usable dependency info; rebuild to regenerate it.
                dirty = true;
                state.edges.get_mut(edge_id).deps_missing = true;
            }
        }

        // Visit all inputs; we're dirty if any non-order-only input is.
        let inputs = state.edges.get(edge_id).inputs.clone();
        let mut most_recent_input: Option<NodeId> = None;
        for (i, &input) in inputs.iter().enumerate() {
            self.recompute_node_dirty(state, input, stack, validations)?;

            // If an input is not ready, neither are our outputs.
            if let Some(in_edge) = state.nodes.get(input).in_edge {
                if !state.edges.get(in_edge).outputs_ready {
                    state.edges.get_mut(edge_id).outputs_ready = false;
                }
            }

            if !state.edges.get(edge_id).is_order_only(i) {
                if state.nodes.get(input).dirty() {
                    explain!(self, "{} is dirty", state.node_path(input));
                    dirty = true;
                } else {
                    let newer = match most_recent_input {
                        None => true,
                        Some(prev) => {
                            state.nodes.get(input).mtime > state.nodes.get(prev).mtime
                        }
                    };
                    if newer {
                        most_recent_input = Some(input);
                    }
                }
            }
        }

        validations.extend(state.edges.get(edge_id).validations.iter().copied());

        // We may also be dirty due to output state: missing or out-of-date
        // outputs, a changed command, a missing log record.
        if !dirty {
            dirty = self.recompute_outputs_dirty(state, edge_id, most_recent_input);
        }

        for &output in &outputs {
            state.nodes.get_mut(output).set_dirty(dirty);
        }

        // A dirty edge's outputs aren't ready.  (An edge can also be clean
        // yet unready, via order-only inputs.)  Phony edges with no inputs
        // have nothing to do, so they stay ready.
        if dirty
            && !(state.edges.get(edge_id).is_phony()
                && state.edges.get(edge_id).inputs.is_empty())
        {
            state.edges.get_mut(edge_id).outputs_ready = false;
        }

        state.edges.get_mut(edge_id).mark = VisitMark::Done;
        debug_assert_eq!(stack.last(), Some(&node));
        stack.pop();
        Ok(())
    }

    /// Whether any output of the edge is out of date relative to the newest
    /// input and the recorded build log state.  Inputs and outputs must have
    /// been statted already.
    pub fn recompute_outputs_dirty(
        &self,
        state: &State,
        edge_id: EdgeId,
        most_recent_input: Option<NodeId>,
    ) -> bool {
        let edge = state.edges.get(edge_id);
        let command = edge.command_for_log();
        edge.outputs
            .iter()
            .any(|&output| self.recompute_output_dirty(state, edge_id, most_recent_input, &command, output))
    }

    fn recompute_output_dirty(
        &self,
        state: &State,
        edge_id: EdgeId,
        most_recent_input: Option<NodeId>,
        command: &str,
        output: NodeId,
    ) -> bool {
        let edge = state.edges.get(edge_id);
        let out_node = state.nodes.get(output);

        if edge.is_phony() {
            // Phony edges don't write output.  They're dirty only when used
            // to alias a missing file with no inputs.
            return edge.inputs.is_empty() && !out_node.exists();
        }

        if !out_node.exists() {
            explain!(self, "output {} doesn't exist", out_node.path);
            return true;
        }

        let mut entry = None;

        if let Some(input) = most_recent_input {
            let input_mtime = state.nodes.get(input).mtime.unwrap_or_default();
            let mut output_mtime = out_node.mtime.unwrap_or_default();

            // A restat rule may have cleaned the output in a previous run,
            // recording the then-newest input mtime in the build log.  Use
            // that instead, so only a genuinely newer input re-dirties us.
            let mut used_restat = false;
            if edge.restat {
                if let Some(log_entry) = self.build_log.lookup(&out_node.path) {
                    output_mtime = log_entry.mtime;
                    used_restat = true;
                    entry = Some(log_entry);
                }
            }

            if output_mtime < input_mtime {
                explain!(
                    self,
                    "{}output {} older than most recent input {} ({} vs {})",
                    if used_restat { "restat of " } else { "" },
                    out_node.path,
                    state.node_path(input),
                    output_mtime,
                    input_mtime
                );
                return true;
            }
        }

        if entry.is_none() {
            entry = self.build_log.lookup(&out_node.path);
        }
        match entry {
            Some(entry) => {
                // A changed command line dirties the output, except for
                // generator rules, which are trusted to manage themselves.
                if !edge.generator && hash::hash_command(command) != entry.command_hash {
                    explain!(self, "command line changed for {}", out_node.path);
                    return true;
                }
                // The recorded mtime can lag the newest input even when the
                // on-disk mtime doesn't (restat rules write that way).
                if let Some(input) = most_recent_input {
                    if entry.mtime < state.nodes.get(input).mtime.unwrap_or_default() {
                        explain!(
                            self,
                            "recorded mtime of {} older than most recent input {}",
                            out_node.path,
                            state.node_path(input)
                        );
                        return true;
                    }
                }
            }
            None => {
                if !edge.generator {
                    explain!(self, "command line not found in log for {}", out_node.path);
                    return true;
                }
            }
        }

        false
    }

    /// Fold recorded discovered dependencies into the edge's implicit
    /// inputs.  Ok(false) means the info is missing or stale and the edge
    /// must rebuild to regenerate it.
    fn load_deps(&self, state: &mut State, edge_id: EdgeId) -> anyhow::Result<bool> {
        let edge = state.edges.get(edge_id);
        if edge.deps != DepsKind::None {
            let output = match edge.primary_output() {
                Some(output) => output,
                None => return Ok(true),
            };
            let entry = match self.deps_log.get_deps(output) {
                Some(entry) => entry,
                None => {
                    explain!(self, "deps for '{}' are missing", state.node_path(output));
                    return Ok(false);
                }
            };
            let out_node = state.nodes.get(output);
            if out_node.exists() && entry.mtime < out_node.mtime.unwrap_or_default() {
                explain!(
                    self,
                    "stale deps for '{}' (recorded {}, output {})",
                    out_node.path,
                    entry.mtime,
                    out_node.mtime.unwrap_or_default()
                );
                return Ok(false);
            }
            let inputs = entry.inputs.clone();
            insert_implicit_deps(state, edge_id, &inputs);
            return Ok(true);
        }

        if let Some(depfile) = edge.depfile.clone() {
            return self.load_depfile_deps(state, edge_id, &depfile);
        }
        Ok(true)
    }

    /// Read and fold in a depfile at scan time, for rules that declare a
    /// depfile without `deps =`.
    fn load_depfile_deps(
        &self,
        state: &mut State,
        edge_id: EdgeId,
        depfile_path: &str,
    ) -> anyhow::Result<bool> {
        let mut contents = match self.disk.read_file(depfile_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                explain!(self, "depfile '{}' is missing", depfile_path);
                return Ok(false);
            }
            Err(err) => return Err(anyhow!("loading '{}': {}", depfile_path, err)),
        };
        contents.push(0);
        let mut scanner = Scanner::new(&contents);
        let parsed = depfile::parse(&mut scanner)
            .map_err(|err| anyhow!(scanner.format_parse_error(Path::new(depfile_path), err)))?;

        let output = match state.edges.get(edge_id).primary_output() {
            Some(output) => output,
            None => return Ok(true),
        };
        let output_path = state.node_path(output).to_owned();
        let deps: Vec<String> = match parsed.get(output_path.as_str()) {
            Some(deps) => deps.iter().map(|dep| canon_path(*dep)).collect(),
            None => {
                return Err(anyhow!(
                    "expected depfile '{}' to mention '{}'",
                    depfile_path,
                    output_path
                ))
            }
        };
        let nodes: Vec<NodeId> = deps.into_iter().map(|dep| state.get_node(dep)).collect();
        insert_implicit_deps(state, edge_id, &nodes);
        Ok(true)
    }

    fn stat_if_necessary(&self, state: &mut State, node: NodeId) -> anyhow::Result<()> {
        if state.nodes.get(node).mtime.is_some() {
            return Ok(());
        }
        let mtime = self.disk.stat(state.node_path(node))?;
        state.nodes.get_mut(node).mtime = Some(mtime);
        Ok(())
    }

    fn cycle_error(
        &self,
        state: &State,
        edge_id: EdgeId,
        node: NodeId,
        stack: &[NodeId],
    ) -> anyhow::Error {
        // Walk back to where this edge entered the stack, so the report
        // starts and ends with the same node.
        let start = stack
            .iter()
            .position(|&n| state.nodes.get(n).in_edge == Some(edge_id))
            .unwrap_or(0);
        let mut cycle = vec![state.node_path(node)];
        cycle.extend(stack[start + 1..].iter().map(|&n| state.node_path(n)));
        cycle.push(state.node_path(node));
        anyhow!("dependency cycle: {}", cycle.join(" -> "))
    }
}

/// Splice discovered dependencies into an edge's implicit-input section and
/// wire up the reverse links.
fn insert_implicit_deps(state: &mut State, edge_id: EdgeId, deps: &[NodeId]) {
    if deps.is_empty() {
        return;
    }
    {
        let edge = state.edges.get_mut(edge_id);
        let pos = edge.explicit_ins + edge.implicit_ins;
        edge.inputs.splice(pos..pos, deps.iter().copied());
        edge.implicit_ins += deps.len();
    }
    for &dep in deps {
        state.nodes.get_mut(dep).out_edges.push(edge_id);
    }
}
