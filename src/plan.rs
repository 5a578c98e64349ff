//! The plan: the set of edges whose outputs are wanted and not yet built,
//! and the machinery that feeds them to the runner in a deterministic,
//! pool-respecting order.
//!
//! An edge moves through want states: not in the plan at all, wanted but not
//! yet startable (`ToStart`), or scheduled/running (`ToFinish`).  The ready
//! queue and per-pool delayed sets are ordered by critical time (the longest
//! chain of recorded durations from the edge to a root) with edge ids as the
//! deterministic tie-break.

use crate::build_log::BuildLog;
use crate::dyndep::Dyndeps;
use crate::graph::{EdgeId, EdgePriority, NodeId, State, VisitMark};
use crate::scan::DependencyScan;
use anyhow::bail;
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Want {
    /// The edge is in the plan only as a dependency holder; we don't need to
    /// run it ourselves.
    Nothing,
    /// We want to run the edge once its inputs are ready.
    ToStart,
    /// The edge has been handed to a pool or the ready queue.
    ToFinish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeResult {
    Failed,
    Succeeded,
}

#[derive(Default)]
pub struct Plan {
    want: HashMap<EdgeId, Want>,
    ready: BTreeSet<EdgePriority>,
    /// Wanted edges not yet finished.
    wanted_edges: usize,
    /// Wanted non-phony edges; shrinks when restat pruning drops work.
    command_edges: usize,
}

impl Plan {
    pub fn new() -> Self {
        Plan::default()
    }

    /// Whether there is work left to finish.  A plan holding only phony
    /// edges has nothing to actually run.
    pub fn more_to_do(&self) -> bool {
        self.wanted_edges > 0 && self.command_edges > 0
    }

    pub fn command_edge_count(&self) -> usize {
        self.command_edges
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Pull the highest-priority ready edge, if any.
    pub fn pop_ready(&mut self) -> Option<EdgeId> {
        let pri = *self.ready.iter().next()?;
        self.ready.remove(&pri);
        Some(pri.id)
    }

    /// Add a target node; Ok(false) means it is already up to date.
    pub fn add_target(&mut self, state: &mut State, node: NodeId) -> anyhow::Result<bool> {
        self.add_sub_target(state, node, None, None)
    }

    fn add_sub_target(
        &mut self,
        state: &mut State,
        node: NodeId,
        dependent: Option<NodeId>,
        mut dyndep_walk: Option<&mut HashSet<EdgeId>>,
    ) -> anyhow::Result<bool> {
        let edge = match state.nodes.get(node).in_edge {
            None => {
                if state.nodes.get(node).dirty() {
                    // A wanted file with no rule: missing source.
                    match dependent {
                        Some(dependent) => bail!(
                            "'{}', needed by '{}', missing and no known rule to make it",
                            state.node_path(node),
                            state.node_path(dependent)
                        ),
                        None => bail!(
                            "'{}' missing and no known rule to make it",
                            state.node_path(node)
                        ),
                    }
                }
                return Ok(false);
            }
            Some(edge) => edge,
        };

        if state.edges.get(edge).outputs_ready {
            return Ok(false); // Nothing to do.
        }

        let newly_inserted = !self.want.contains_key(&edge);
        let want = self.want.entry(edge).or_insert(Want::Nothing);

        if dyndep_walk.is_some() && *want == Want::ToFinish {
            return Ok(false); // Already scheduled; dyndep walk can stop here.
        }

        if state.nodes.get(node).dirty() && *want == Want::Nothing {
            *want = Want::ToStart;
            self.edge_wanted(state, edge);
        }

        if let Some(walk) = dyndep_walk.as_deref_mut() {
            walk.insert(edge);
        }

        if !newly_inserted {
            return Ok(true); // We've already processed the inputs.
        }

        for input in state.edges.get(edge).inputs.clone() {
            self.add_sub_target(state, input, Some(node), dyndep_walk.as_deref_mut())?;
        }
        Ok(true)
    }

    fn edge_wanted(&mut self, state: &State, edge: EdgeId) {
        self.wanted_edges += 1;
        if !state.edges.get(edge).is_phony() {
            self.command_edges += 1;
        }
    }

    /// Compute priorities and queue every startable edge.  Called once after
    /// all targets are added, before the first pop.
    pub fn prepare_queue(&mut self, state: &mut State, build_log: &BuildLog) {
        self.compute_critical_time(state, build_log);
        let mut startable: Vec<EdgeId> = self
            .want
            .iter()
            .filter(|(_, want)| **want == Want::ToStart)
            .map(|(&edge, _)| edge)
            .collect();
        startable.sort();
        for edge in startable {
            if all_inputs_ready(state, edge) {
                self.schedule_work(state, edge);
            }
        }
    }

    /// Critical time of an edge: its own recorded duration plus the longest
    /// critical time among wanted consumers of its outputs.
    fn compute_critical_time(&self, state: &mut State, build_log: &BuildLog) {
        let edges: Vec<EdgeId> = self.want.keys().copied().collect();
        for edge in edges {
            self.visit_critical_time(state, build_log, edge);
        }
    }

    fn visit_critical_time(
        &self,
        state: &mut State,
        build_log: &BuildLog,
        edge: EdgeId,
    ) -> i64 {
        let cached = state.edges.get(edge).critical_time_ms;
        if cached >= 0 {
            return cached;
        }
        let mut longest_consumer = 0;
        for output in state.edges.get(edge).outputs.clone() {
            for consumer in state.nodes.get(output).out_edges.clone() {
                if !self.want.contains_key(&consumer) {
                    continue;
                }
                longest_consumer =
                    longest_consumer.max(self.visit_critical_time(state, build_log, consumer));
            }
        }
        let duration = self.edge_duration(state, build_log, edge);
        let critical = duration + longest_consumer;
        state.edges.get_mut(edge).critical_time_ms = critical;
        critical
    }

    fn edge_duration(&self, state: &State, build_log: &BuildLog, edge_id: EdgeId) -> i64 {
        let edge = state.edges.get(edge_id);
        if edge.is_phony() {
            return 0;
        }
        edge.primary_output()
            .and_then(|out| build_log.lookup(state.node_path(out)))
            .map(|entry| entry.duration_ms().max(1) as i64)
            .unwrap_or(1)
    }

    fn schedule_work(&mut self, state: &mut State, edge: EdgeId) {
        // An edge can reach here twice when two paths converge on it; only
        // the first transition counts.
        match self.want.get_mut(&edge) {
            Some(want) if *want == Want::ToStart => *want = Want::ToFinish,
            _ => return,
        }
        let (pool_id, pri) = {
            let e = state.edges.get(edge);
            (
                e.pool,
                EdgePriority {
                    critical_time_ms: e.critical_time_ms.max(0),
                    id: edge,
                    weight: e.weight,
                },
            )
        };
        let pool = state.pools.get_mut(pool_id);
        if pool.should_delay_edges() {
            pool.delay_edge(pri);
            pool.retrieve_ready_edges(&mut self.ready);
        } else {
            pool.edge_scheduled(pri.weight);
            self.ready.insert(pri);
        }
    }

    /// Apply an edge completion: free pool capacity, and on success promote
    /// consumers whose inputs are now all ready.  Finished nodes that are
    /// pending dyndep files are reported through `dyndeps_to_load`; the
    /// caller loads them and then calls `dyndeps_loaded`.
    pub fn edge_finished(
        &mut self,
        state: &mut State,
        edge: EdgeId,
        result: EdgeResult,
        dyndeps_to_load: &mut Vec<NodeId>,
    ) {
        let directly_wanted = matches!(self.want.get(&edge), Some(want) if *want != Want::Nothing);

        // See if this job frees up any delayed jobs.
        let (pool_id, weight) = {
            let e = state.edges.get(edge);
            (e.pool, e.weight)
        };
        if directly_wanted {
            state.pools.get_mut(pool_id).edge_finished(weight);
        }
        state
            .pools
            .get_mut(pool_id)
            .retrieve_ready_edges(&mut self.ready);

        if result == EdgeResult::Failed {
            return;
        }

        if directly_wanted {
            self.wanted_edges -= 1;
        }
        self.want.remove(&edge);
        state.edges.get_mut(edge).outputs_ready = true;

        // Check off any nodes we were waiting for with this edge.
        for output in state.edges.get(edge).outputs.clone() {
            self.node_finished(state, output, dyndeps_to_load);
        }
    }

    fn node_finished(
        &mut self,
        state: &mut State,
        node: NodeId,
        dyndeps_to_load: &mut Vec<NodeId>,
    ) {
        // If this node now exists and carries pending dyndep info, it must
        // be loaded before dependents are evaluated.
        if state.nodes.get(node).dyndep_pending {
            dyndeps_to_load.push(node);
            return;
        }

        let mut consumers = state.nodes.get(node).out_edges.clone();
        consumers.extend(state.nodes.get(node).validation_out_edges.iter().copied());
        for consumer in consumers {
            if self.want.contains_key(&consumer) {
                self.edge_maybe_ready(state, consumer, dyndeps_to_load);
            }
        }
    }

    fn edge_maybe_ready(
        &mut self,
        state: &mut State,
        edge: EdgeId,
        dyndeps_to_load: &mut Vec<NodeId>,
    ) {
        if !all_inputs_ready(state, edge) {
            return;
        }
        match self.want.get(&edge) {
            Some(Want::Nothing) => {
                // We don't need to run this edge, but a dependent might need
                // its completion; treat it as instantly finished.
                self.edge_finished(state, edge, EdgeResult::Succeeded, dyndeps_to_load);
            }
            Some(_) => self.schedule_work(state, edge),
            None => {}
        }
    }

    /// Restat propagation: `node` turned out unchanged after its edge ran.
    /// Consumers whose remaining inputs are clean and whose outputs check
    /// out are un-wanted, pruning whole subtrees from the plan.
    pub fn clean_node(
        &mut self,
        scan: &DependencyScan,
        state: &mut State,
        node: NodeId,
    ) -> anyhow::Result<()> {
        state.nodes.get_mut(node).set_dirty(false);

        for consumer in state.nodes.get(node).out_edges.clone() {
            match self.want.get(&consumer) {
                Some(Want::Nothing) | None => continue,
                Some(_) => {}
            }
            // An edge whose deps are missing must still run to regenerate
            // them, no matter how clean its inputs look.
            if state.edges.get(consumer).deps_missing {
                continue;
            }

            let dirtying: Vec<NodeId> = state.edges.get(consumer).dirtying_ins().to_vec();
            if dirtying.iter().any(|&input| state.nodes.get(input).dirty()) {
                continue;
            }

            let most_recent_input = dirtying
                .iter()
                .copied()
                .max_by_key(|&input| state.nodes.get(input).mtime.unwrap_or_default());
            if !scan.recompute_outputs_dirty(state, consumer, most_recent_input) {
                for output in state.edges.get(consumer).outputs.clone() {
                    self.clean_node(scan, state, output)?;
                }
                if let Some(want) = self.want.get_mut(&consumer) {
                    *want = Want::Nothing;
                    self.wanted_edges -= 1;
                    if !state.edges.get(consumer).is_phony() {
                        self.command_edges -= 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Fold freshly loaded dyndep information into the plan: recompute
    /// dependent dirtiness, pull in new inputs, and schedule whatever became
    /// ready.  Returns further dyndep files that finished in the process.
    pub fn dyndeps_loaded(
        &mut self,
        scan: &DependencyScan,
        state: &mut State,
        node: NodeId,
        updates: &[(EdgeId, Dyndeps)],
    ) -> anyhow::Result<Vec<NodeId>> {
        let mut dyndep_walk: HashSet<EdgeId> = HashSet::new();
        let validations = self.refresh_dyndep_dependents(scan, state, node)?;
        for validation in validations {
            if let Some(in_edge) = state.nodes.get(validation).in_edge {
                if !state.edges.get(in_edge).outputs_ready {
                    self.add_sub_target(state, validation, None, Some(&mut dyndep_walk))?;
                }
            }
        }

        for (edge, dyndeps) in updates {
            if !self.want.contains_key(edge) {
                continue;
            }
            dyndep_walk.insert(*edge);
            let dependent = state.edges.get(*edge).primary_output();
            for &input in &dyndeps.implicit_inputs {
                self.add_sub_target(state, input, dependent, Some(&mut dyndep_walk))?;
            }
        }

        // See if any encountered edges are now ready.
        let mut encountered: Vec<EdgeId> = dyndep_walk.into_iter().collect();
        encountered.sort();
        let mut dyndeps_to_load = Vec::new();
        for edge in encountered {
            if self.want.contains_key(&edge) {
                self.edge_maybe_ready(state, edge, &mut dyndeps_to_load);
            }
        }
        Ok(dyndeps_to_load)
    }

    /// Re-derive the dirty state of everything downstream of a dyndep node,
    /// clearing scan marks first so the walk actually recomputes.  Newly
    /// dirty nodes promote their (already planned) edges to wanted.
    fn refresh_dyndep_dependents(
        &mut self,
        scan: &DependencyScan,
        state: &mut State,
        node: NodeId,
    ) -> anyhow::Result<Vec<NodeId>> {
        let mut dependents = HashSet::new();
        self.unmark_dependents(state, node, &mut dependents);
        let mut sorted: Vec<NodeId> = dependents.into_iter().collect();
        sorted.sort();

        let mut all_validations = Vec::new();
        for dependent in sorted {
            let mut validations = Vec::new();
            scan.recompute_dirty(state, dependent, &mut validations)?;
            all_validations.extend(validations);

            if !state.nodes.get(dependent).dirty() {
                continue;
            }
            let edge = match state.nodes.get(dependent).in_edge {
                Some(edge) => edge,
                None => continue,
            };
            if let Some(want) = self.want.get_mut(&edge) {
                if *want == Want::Nothing {
                    *want = Want::ToStart;
                    self.edge_wanted(state, edge);
                }
            }
        }
        Ok(all_validations)
    }

    fn unmark_dependents(
        &self,
        state: &mut State,
        node: NodeId,
        dependents: &mut HashSet<NodeId>,
    ) {
        for edge in state.nodes.get(node).out_edges.clone() {
            if !self.want.contains_key(&edge) {
                continue;
            }
            if state.edges.get(edge).mark != VisitMark::None {
                state.edges.get_mut(edge).mark = VisitMark::None;
            }
            for output in state.edges.get(edge).outputs.clone() {
                if dependents.insert(output) {
                    self.unmark_dependents(state, output, dependents);
                }
            }
        }
    }
}

/// Generated inputs are ready when their producing edges are; source inputs
/// are always ready.
fn all_inputs_ready(state: &State, edge: EdgeId) -> bool {
    state.edges.get(edge).inputs.iter().all(|&input| {
        match state.nodes.get(input).in_edge {
            Some(in_edge) => state.edges.get(in_edge).outputs_ready,
            None => true,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_log::BuildLog;
    use crate::disk::TimeStamp;
    use crate::graph::{Rule, PHONY_RULE};
    use crate::hash;
    use crate::smallmap::SmallMap;
    use std::rc::Rc;

    fn make_edge(state: &mut State, rule: &str, ins: &[&str], outs: &[&str]) -> EdgeId {
        let rule = Rc::new(Rule {
            name: rule.to_owned(),
            bindings: SmallMap::default(),
        });
        let edge = state.add_edge(rule.clone());
        for &input in ins {
            state.add_in(edge, input);
        }
        for &output in outs {
            state.add_out(edge, output).unwrap();
        }
        let e = state.edges.get_mut(edge);
        e.explicit_ins = ins.len();
        e.explicit_outs = outs.len();
        e.cmdline = Some(format!("{} {:?} > {:?}", rule.name, ins, outs));
        edge
    }

    /// Mark an edge as needing to run, the way a scan would have.
    fn mark_dirty(state: &mut State, edge: EdgeId) {
        for output in state.edges.get(edge).outputs.clone() {
            state.nodes.get_mut(output).set_dirty(true);
        }
        state.edges.get_mut(edge).outputs_ready = false;
    }

    fn finish(plan: &mut Plan, state: &mut State, edge: EdgeId) {
        let mut dyndeps = Vec::new();
        plan.edge_finished(state, edge, EdgeResult::Succeeded, &mut dyndeps);
        assert!(dyndeps.is_empty());
    }

    #[test]
    fn chain_runs_in_order() {
        let mut state = State::new();
        let first = make_edge(&mut state, "cat", &["in"], &["mid"]);
        let second = make_edge(&mut state, "cat", &["mid"], &["out"]);
        mark_dirty(&mut state, first);
        mark_dirty(&mut state, second);

        let mut plan = Plan::new();
        let out = state.lookup_node("out").unwrap();
        assert!(plan.add_target(&mut state, out).unwrap());
        plan.prepare_queue(&mut state, &BuildLog::new());

        assert!(plan.more_to_do());
        assert_eq!(plan.pop_ready(), Some(first));
        // `second` waits on mid.
        assert_eq!(plan.pop_ready(), None);

        finish(&mut plan, &mut state, first);
        assert_eq!(plan.pop_ready(), Some(second));
        finish(&mut plan, &mut state, second);
        assert!(!plan.more_to_do());
    }

    #[test]
    fn up_to_date_target_adds_no_work() {
        let mut state = State::new();
        let edge = make_edge(&mut state, "cat", &["in"], &["out"]);
        state.edges.get_mut(edge).outputs_ready = true;
        let mut plan = Plan::new();
        let out = state.lookup_node("out").unwrap();
        assert!(!plan.add_target(&mut state, out).unwrap());
        assert!(!plan.more_to_do());
    }

    #[test]
    fn missing_source_is_an_error() {
        let mut state = State::new();
        let edge = make_edge(&mut state, "cat", &["in"], &["out"]);
        mark_dirty(&mut state, edge);
        let input = state.lookup_node("in").unwrap();
        state.nodes.get_mut(input).set_dirty(true);

        let mut plan = Plan::new();
        let out = state.lookup_node("out").unwrap();
        let err = plan.add_target(&mut state, out).unwrap_err();
        assert_eq!(
            err.to_string(),
            "'in', needed by 'out', missing and no known rule to make it"
        );
    }

    #[test]
    fn pool_depth_limits_in_flight_edges() {
        let mut state = State::new();
        let pool = state.add_pool("link".to_owned(), 2).unwrap();
        let mut edges = Vec::new();
        for i in 0..3 {
            let edge = make_edge(&mut state, "ln", &[], &[&format!("out{}", i)]);
            state.edges.get_mut(edge).pool = pool;
            mark_dirty(&mut state, edge);
            edges.push(edge);
        }
        let all = make_edge(&mut state, PHONY_RULE, &["out0", "out1", "out2"], &["all"]);
        state.edges.get_mut(all).cmdline = None;
        mark_dirty(&mut state, all);

        let mut plan = Plan::new();
        let target = state.lookup_node("all").unwrap();
        plan.add_target(&mut state, target).unwrap();
        plan.prepare_queue(&mut state, &BuildLog::new());

        // Only two fit in the pool at once.
        let a = plan.pop_ready().unwrap();
        let b = plan.pop_ready().unwrap();
        assert_eq!(plan.pop_ready(), None);
        assert_ne!(a, b);

        // Completing one releases the third.
        finish(&mut plan, &mut state, a);
        let c = plan.pop_ready().unwrap();
        assert!(c != a && c != b);
    }

    #[test]
    fn ready_order_follows_recorded_durations() {
        let mut state = State::new();
        // Two independent chains; the slow chain's head must be scheduled
        // first.
        let slow = make_edge(&mut state, "cc", &[], &["slow.o"]);
        let slow_link = make_edge(&mut state, "cc", &["slow.o"], &["slow"]);
        let quick = make_edge(&mut state, "cc", &[], &["quick.o"]);
        let all = make_edge(&mut state, PHONY_RULE, &["slow", "quick.o"], &["all"]);
        state.edges.get_mut(all).cmdline = None;
        for edge in [slow, slow_link, quick, all] {
            mark_dirty(&mut state, edge);
        }

        let mut log = BuildLog::new();
        let slow_cmd_hash = hash::hash_command("x");
        log.record("slow.o", slow_cmd_hash, 0, 500, TimeStamp(1)).unwrap();
        log.record("slow", slow_cmd_hash, 0, 500, TimeStamp(1)).unwrap();
        log.record("quick.o", slow_cmd_hash, 0, 10, TimeStamp(1)).unwrap();

        let mut plan = Plan::new();
        let target = state.lookup_node("all").unwrap();
        plan.add_target(&mut state, target).unwrap();
        plan.prepare_queue(&mut state, &log);

        // Critical times: slow = 500 + 500 = 1000, quick = 10.
        assert_eq!(state.edges.get(slow).critical_time_ms, 1000);
        assert_eq!(state.edges.get(quick).critical_time_ms, 10);
        assert_eq!(plan.pop_ready(), Some(slow));
        assert_eq!(plan.pop_ready(), Some(quick));
    }

    #[test]
    fn tie_break_is_by_edge_id() {
        let mut state = State::new();
        let a = make_edge(&mut state, "cc", &[], &["a"]);
        let b = make_edge(&mut state, "cc", &[], &["b"]);
        let all = make_edge(&mut state, PHONY_RULE, &["a", "b"], &["all"]);
        state.edges.get_mut(all).cmdline = None;
        for edge in [a, b, all] {
            mark_dirty(&mut state, edge);
        }

        let mut plan = Plan::new();
        let target = state.lookup_node("all").unwrap();
        plan.add_target(&mut state, target).unwrap();
        plan.prepare_queue(&mut state, &BuildLog::new());
        assert_eq!(plan.pop_ready(), Some(a));
        assert_eq!(plan.pop_ready(), Some(b));
    }

    #[test]
    fn phony_edge_completes_and_unblocks() {
        let mut state = State::new();
        let real = make_edge(&mut state, "cc", &[], &["lib"]);
        let alias = make_edge(&mut state, PHONY_RULE, &["lib"], &["alias"]);
        state.edges.get_mut(alias).cmdline = None;
        let user = make_edge(&mut state, "cc", &["alias"], &["app"]);
        for edge in [real, alias, user] {
            mark_dirty(&mut state, edge);
        }

        let mut plan = Plan::new();
        let target = state.lookup_node("app").unwrap();
        plan.add_target(&mut state, target).unwrap();
        plan.prepare_queue(&mut state, &BuildLog::new());

        assert_eq!(plan.pop_ready(), Some(real));
        finish(&mut plan, &mut state, real);
        // The phony alias is now ready; completing it unblocks the consumer.
        assert_eq!(plan.pop_ready(), Some(alias));
        finish(&mut plan, &mut state, alias);
        assert_eq!(plan.pop_ready(), Some(user));
    }

    #[test]
    fn clean_node_prunes_unchanged_subtree() {
        use crate::deps_log::DepsLog;
        use crate::disk::VirtualDisk;

        let mut state = State::new();
        let producer = make_edge(&mut state, "r", &["in"], &["mid"]);
        let consumer = make_edge(&mut state, "cat", &["mid"], &["out"]);
        mark_dirty(&mut state, producer);
        mark_dirty(&mut state, consumer);

        // Stat state as the driver would have it after the producer ran and
        // restat saw "mid" unchanged: mid's mtime still newer than nothing,
        // out exists and is newer, and the log matches the command.
        let input = state.lookup_node("in").unwrap();
        let mid = state.lookup_node("mid").unwrap();
        let out = state.lookup_node("out").unwrap();
        state.nodes.get_mut(input).mtime = Some(TimeStamp(1));
        state.nodes.get_mut(mid).mtime = Some(TimeStamp(2));
        state.nodes.get_mut(out).mtime = Some(TimeStamp(3));

        let mut log = BuildLog::new();
        let consumer_cmd = state.edges.get(consumer).command_for_log();
        log.record("out", hash::hash_command(&consumer_cmd), 0, 1, TimeStamp(3))
            .unwrap();

        let mut plan = Plan::new();
        plan.add_target(&mut state, out).unwrap();
        plan.prepare_queue(&mut state, &log);
        assert_eq!(plan.command_edge_count(), 2);

        assert_eq!(plan.pop_ready(), Some(producer));

        // Producer ran but did not change "mid": the consumer is pruned.
        let disk = VirtualDisk::new();
        let deps_log = DepsLog::new();
        let scan = DependencyScan::new(&disk, &log, &deps_log, false);
        plan.clean_node(&scan, &mut state, mid).unwrap();
        assert_eq!(plan.command_edge_count(), 1);

        finish(&mut plan, &mut state, producer);
        assert_eq!(plan.pop_ready(), None);
        assert!(!plan.more_to_do());
    }
}
