//! The build driver: wants targets, pumps ready edges through the pools into
//! the subprocess runner, applies completions, and keeps both side logs
//! current.  Single-threaded; parallelism lives in the runner's children.

use crate::build_log::BuildLog;
use crate::canon::canon_path;
use crate::deps_log::DepsLog;
use crate::disk::{parent_dir, DiskInterface, TimeStamp};
use crate::dyndep;
use crate::graph::{DepsKind, EdgeId, NodeId, State};
use crate::hash;
use crate::plan::{EdgeResult, Plan};
use crate::scan::DependencyScan;
use crate::signal;
use crate::status::Status;
use crate::task::{FinishedTask, Runner, TaskSpec, Termination};
use crate::trace;
use anyhow::bail;
use std::collections::HashMap;
use std::time::Instant;

/// The build was stopped by the user; surfaced as a distinguished error so
/// the exit code can say so.
#[derive(Debug)]
pub struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "interrupted by user")
    }
}

impl std::error::Error for Interrupted {}

pub struct Options {
    /// Maximum commands in flight.
    pub parallelism: usize,
    /// Stop starting new work after this many failures; 0 means never stop.
    pub failures_allowed: usize,
    /// Refuse admissions above this 1-minute load average; <= 0 disables.
    pub max_load_average: f64,
    /// Print dirtiness reasoning to stderr.
    pub explain: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            parallelism: 1,
            failures_allowed: 1,
            max_load_average: 0.0,
            explain: false,
        }
    }
}

pub struct Work<'a> {
    state: &'a mut State,
    disk: &'a dyn DiskInterface,
    build_log: &'a mut BuildLog,
    deps_log: &'a mut DepsLog,
    status: &'a mut dyn Status,
    options: &'a Options,
    plan: Plan,
    start_time: Instant,
    /// Dispatch time of each in-flight edge, for log records.
    running: HashMap<EdgeId, i32>,
}

impl<'a> Work<'a> {
    pub fn new(
        state: &'a mut State,
        disk: &'a dyn DiskInterface,
        build_log: &'a mut BuildLog,
        deps_log: &'a mut DepsLog,
        status: &'a mut dyn Status,
        options: &'a Options,
    ) -> Self {
        Work {
            state,
            disk,
            build_log,
            deps_log,
            status,
            options,
            plan: Plan::new(),
            start_time: Instant::now(),
            running: HashMap::new(),
        }
    }

    fn elapsed_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }

    /// The declared default targets, falling back to the graph's roots.
    pub fn default_nodes(&self) -> anyhow::Result<Vec<NodeId>> {
        self.state.default_nodes()
    }

    /// Look up a target by name, with a spelling suggestion on a miss.
    pub fn want_file(&mut self, path: &str) -> anyhow::Result<()> {
        match self.state.lookup_node(path) {
            Some(node) => self.want_node(node),
            None => match self.state.spellcheck_node(path) {
                Some(near) => bail!("unknown target '{}', did you mean '{}'?", path, near.path),
                None => bail!("unknown target '{}'", path),
            },
        }
    }

    /// Scan a target and enter it (and any validation targets discovered
    /// along the way) into the plan.
    pub fn want_node(&mut self, node: NodeId) -> anyhow::Result<()> {
        let mut validations = Vec::new();
        {
            let scan = DependencyScan::new(
                self.disk,
                self.build_log,
                self.deps_log,
                self.options.explain,
            );
            scan.recompute_dirty(self.state, node, &mut validations)?;
        }

        let up_to_date = match self.state.nodes.get(node).in_edge {
            Some(edge) => self.state.edges.get(edge).outputs_ready,
            None => true,
        };
        if !up_to_date {
            self.plan.add_target(self.state, node)?;
        }

        for validation in validations {
            if let Some(edge) = self.state.nodes.get(validation).in_edge {
                if !self.state.edges.get(edge).outputs_ready {
                    self.plan.add_target(self.state, validation)?;
                }
            }
        }
        Ok(())
    }

    /// Run the build.  Ok(Some(n)) means n commands ran and everything is up
    /// to date; Ok(None) means commands failed; Err carries internal errors
    /// and interruption.
    pub fn run(&mut self) -> anyhow::Result<Option<usize>> {
        if !self.plan.more_to_do() {
            return Ok(Some(0));
        }
        self.plan.prepare_queue(self.state, self.build_log);
        self.status.build_started();
        self.status
            .plan_has_total_edges(self.plan.command_edge_count());

        let mut runner = Runner::new(
            self.options.parallelism.max(1),
            self.options.max_load_average,
        );
        let mut failures_remaining = match self.options.failures_allowed {
            0 => None,
            n => Some(n),
        };
        let mut interrupted = false;
        let mut tasks_ran = 0usize;
        let mut tasks_failed = 0usize;

        while self.plan.more_to_do() || runner.is_running() {
            if signal::was_interrupted() {
                interrupted = true;
            }

            let stop_admitting = interrupted || failures_remaining == Some(0);
            if !stop_admitting {
                while runner.can_start_more() {
                    let edge = match self.plan.pop_ready() {
                        Some(edge) => edge,
                        None => break,
                    };
                    if self.state.edges.get(edge).is_phony() {
                        let mut dyndeps = Vec::new();
                        self.plan
                            .edge_finished(self.state, edge, EdgeResult::Succeeded, &mut dyndeps);
                        self.process_dyndeps(dyndeps)?;
                        continue;
                    }
                    self.start_edge(edge, &mut runner)?;
                    tasks_ran += 1;
                }
            }

            if runner.is_running() {
                let task = runner.wait();
                match self.finish_task(task)? {
                    Termination::Success => {}
                    Termination::Failure => {
                        tasks_failed += 1;
                        if let Some(remaining) = &mut failures_remaining {
                            *remaining = remaining.saturating_sub(1);
                        }
                    }
                    Termination::Interrupted => interrupted = true,
                }
                continue;
            }

            // Nothing running and nothing admitted: the build is over, one
            // way or another.
            break;
        }

        self.status.build_finished();

        if interrupted {
            return Err(Interrupted.into());
        }
        if tasks_failed > 0 {
            return Ok(None);
        }
        if self.plan.more_to_do() {
            bail!("ran out of runnable work, but the plan is not finished");
        }
        Ok(Some(tasks_ran))
    }

    fn start_edge(&mut self, edge: EdgeId, runner: &mut Runner) -> anyhow::Result<()> {
        // Make sure the output directories exist before the command needs
        // to write into them.
        for output in self.state.edges.get(edge).outputs.clone() {
            if let Some(dir) = parent_dir(self.state.node_path(output)) {
                self.disk.make_dirs(dir)?;
            }
        }

        let spec = {
            let e = self.state.edges.get(edge);
            TaskSpec {
                cmdline: e.cmdline.clone().unwrap_or_default(),
                use_console: e.use_console,
                deps: e.deps,
                depfile: e.depfile.clone(),
                msvc_deps_prefix: e.msvc_deps_prefix.clone(),
                rspfile: e.rspfile.clone(),
            }
        };

        let start_ms = self.elapsed_ms();
        self.running.insert(edge, start_ms as i32);
        self.status.build_edge_started(self.state, edge, start_ms);
        runner.start(edge, spec);
        Ok(())
    }

    /// Apply one completion: restat, plan propagation, log records.
    /// Returns the task's termination so the caller can count failures.
    fn finish_task(&mut self, task: FinishedTask) -> anyhow::Result<Termination> {
        let edge = task.edge;
        let end_ms = self.elapsed_ms();
        let start_ms = self.running.remove(&edge).unwrap_or(0);
        let success = task.result.termination == Termination::Success;

        self.status
            .build_edge_finished(self.state, edge, end_ms, success, &task.result.output);
        {
            let e = self.state.edges.get(edge);
            let name = e.description.as_deref().or(e.cmdline.as_deref()).unwrap_or("");
            trace::task_span(name, task.tid, task.span);
        }

        let command = self.state.edges.get(edge).command_for_log();
        let command_hash = hash::hash_command(&command);

        if task.result.termination != Termination::Success {
            let mut dyndeps = Vec::new();
            self.plan
                .edge_finished(self.state, edge, EdgeResult::Failed, &mut dyndeps);
            if task.result.termination == Termination::Failure {
                // Record the attempt with a missing mtime, so the next build
                // re-runs it no matter what the command left behind.
                for output in self.state.edges.get(edge).outputs.clone() {
                    let path = self.state.node_path(output).to_owned();
                    self.build_log.record(
                        &path,
                        command_hash,
                        start_ms,
                        end_ms as i32,
                        TimeStamp::MISSING,
                    )?;
                }
            }
            return Ok(task.result.termination);
        }

        // Re-stat outputs.  For restat rules an unchanged output propagates
        // cleanness through the plan, and the log records the newest input
        // mtime instead, so downstream work stays skipped next run.
        let restat = self.state.edges.get(edge).restat;
        let outputs = self.state.edges.get(edge).outputs.clone();
        let mut output_mtime = TimeStamp::MISSING;
        let mut node_cleaned = false;
        for &output in &outputs {
            let path = self.state.node_path(output).to_owned();
            self.disk.invalidate(&path);
            let old_mtime = self.state.nodes.get(output).mtime.unwrap_or_default();
            let new_mtime = self.disk.stat(&path)?;
            self.state.nodes.get_mut(output).mtime = Some(new_mtime);
            if new_mtime > output_mtime {
                output_mtime = new_mtime;
            }
            if restat && new_mtime == old_mtime {
                let scan = DependencyScan::new(
                    self.disk,
                    self.build_log,
                    self.deps_log,
                    self.options.explain,
                );
                self.plan.clean_node(&scan, self.state, output)?;
                node_cleaned = true;
            }
        }

        if node_cleaned {
            // Back-date the recorded mtime to the newest input (or the
            // depfile), the anchor future scans compare against.
            let mut restat_mtime = TimeStamp::MISSING;
            for input in self.state.edges.get(edge).dirtying_ins().to_vec() {
                let mtime = self.disk.stat(self.state.node_path(input))?;
                if mtime > restat_mtime {
                    restat_mtime = mtime;
                }
            }
            let e = self.state.edges.get(edge);
            if restat_mtime.exists() && e.deps == DepsKind::None {
                if let Some(depfile) = e.depfile.clone() {
                    let depfile_mtime = self.disk.stat(&depfile)?;
                    if depfile_mtime > restat_mtime {
                        restat_mtime = depfile_mtime;
                    }
                }
            }
            // Restat pruning may have shrunk the plan.
            self.status
                .plan_has_total_edges(self.plan.command_edge_count());
            output_mtime = restat_mtime;
        }

        let mut dyndeps_to_load = Vec::new();
        self.plan
            .edge_finished(self.state, edge, EdgeResult::Succeeded, &mut dyndeps_to_load);

        // The response file served its purpose.
        if let Some(rspfile) = self.state.edges.get(edge).rspfile.clone() {
            self.disk.remove_file(&rspfile.path)?;
        }

        for &output in &outputs {
            let path = self.state.node_path(output).to_owned();
            self.build_log
                .record(&path, command_hash, start_ms, end_ms as i32, output_mtime)?;
        }

        // Record discovered dependencies.
        if self.state.edges.get(edge).deps != DepsKind::None {
            let deps_nodes: Vec<NodeId> = task
                .result
                .discovered_deps
                .unwrap_or_default()
                .into_iter()
                .map(|path| self.state.get_node(canon_path(path)))
                .collect();
            for &output in &outputs {
                let path = self.state.node_path(output).to_owned();
                let deps_mtime = self.disk.stat(&path)?;
                self.deps_log
                    .record_deps(self.state, output, deps_mtime, &deps_nodes)?;
            }
        }

        self.process_dyndeps(dyndeps_to_load)?;
        Ok(Termination::Success)
    }

    /// Load dyndep files that just finished building and fold them into the
    /// plan; loading may complete further dyndep files.
    fn process_dyndeps(&mut self, mut pending: Vec<NodeId>) -> anyhow::Result<()> {
        while let Some(node) = pending.pop() {
            self.disk.invalidate(self.state.node_path(node));
            let updates = dyndep::load_dyndeps(self.state, self.disk, node)?;
            let more = {
                let scan = DependencyScan::new(
                    self.disk,
                    self.build_log,
                    self.deps_log,
                    self.options.explain,
                );
                self.plan
                    .dyndeps_loaded(&scan, self.state, node, &updates)?
            };
            pending.extend(more);
            self.status
                .plan_has_total_edges(self.plan.command_edge_count());
        }
        Ok(())
    }
}
