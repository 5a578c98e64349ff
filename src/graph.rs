//! The build graph: nodes (files), edges (commands), rules, and pools.
//!
//! The `State` arena owns every node and edge; cross-links between them are
//! integer ids, so neither owns the other.  Per-build scratch state (node
//! status, edge marks) lives alongside the topology and is cleared by
//! `reset` when a manifest is re-loaded mid-process.

use crate::canon::canonicalize_path_in_place;
use crate::densemap::{self, DenseMap};
use crate::disk::TimeStamp;
use crate::eval::EvalString;
use crate::smallmap::SmallMap;
use anyhow::bail;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);
impl densemap::Index for NodeId {
    fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeId(usize);
impl densemap::Index for EdgeId {
    fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for EdgeId {
    fn from(u: usize) -> EdgeId {
        EdgeId(u)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(usize);
impl densemap::Index for PoolId {
    fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for PoolId {
    fn from(u: usize) -> PoolId {
        PoolId(u)
    }
}

/// Dirtiness of a node within the current scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeStatus {
    #[default]
    Unknown,
    Clean,
    Dirty,
}

/// A file in the graph, identified by canonical path.
#[derive(Debug)]
pub struct Node {
    pub path: String,
    /// The edge producing this file, if any.  At most one.
    pub in_edge: Option<EdgeId>,
    /// Edges consuming this file as an input.
    pub out_edges: Vec<EdgeId>,
    /// Edges naming this file as a validation.
    pub validation_out_edges: Vec<EdgeId>,
    /// Set while this node is a dyndep file whose contents have not yet been
    /// loaded into the graph.
    pub dyndep_pending: bool,

    // Per-build state below; cleared by State::reset.
    /// mtime from the last stat; None until statted.
    pub mtime: Option<TimeStamp>,
    pub status: NodeStatus,
}

impl Node {
    fn new(path: String) -> Node {
        Node {
            path,
            in_edge: None,
            out_edges: Vec::new(),
            validation_out_edges: Vec::new(),
            dyndep_pending: false,
            mtime: None,
            status: NodeStatus::Unknown,
        }
    }

    pub fn exists(&self) -> bool {
        matches!(self.mtime, Some(t) if t.exists())
    }

    pub fn status_known(&self) -> bool {
        self.status != NodeStatus::Unknown
    }

    pub fn dirty(&self) -> bool {
        self.status == NodeStatus::Dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.status = if dirty {
            NodeStatus::Dirty
        } else {
            NodeStatus::Clean
        };
    }

    fn reset(&mut self) {
        self.mtime = None;
        self.status = NodeStatus::Unknown;
    }
}

/// A command template: rule name plus unevaluated variable bindings.
#[derive(Debug)]
pub struct Rule {
    pub name: String,
    pub bindings: SmallMap<String, EvalString<String>>,
}

pub const PHONY_RULE: &str = "phony";

/// How an edge discovers extra dependencies at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepsKind {
    #[default]
    None,
    /// Read a makefile-syntax depfile written by the command.
    Gcc,
    /// Extract `/showIncludes` lines from the command's captured output.
    Msvc,
}

#[derive(Debug, Clone, Hash)]
pub struct RspFile {
    pub path: String,
    pub content: String,
}

/// DFS coloring used by the dependency scan for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisitMark {
    #[default]
    None,
    InStack,
    Done,
}

/// A build statement: one command producing outputs from inputs.
/// Inputs are partitioned explicit | implicit | order-only, outputs
/// explicit | implicit; the counts delimit the partitions.
#[derive(Debug)]
pub struct Edge {
    pub rule: Rc<Rule>,
    pub pool: PoolId,
    pub use_console: bool,

    pub inputs: Vec<NodeId>,
    pub explicit_ins: usize,
    pub implicit_ins: usize,
    pub order_only_ins: usize,
    pub outputs: Vec<NodeId>,
    pub explicit_outs: usize,
    pub validations: Vec<NodeId>,
    pub dyndep: Option<NodeId>,

    // Bindings, evaluated against the edge's scope at load time.
    pub cmdline: Option<String>,
    pub description: Option<String>,
    pub depfile: Option<String>,
    pub rspfile: Option<RspFile>,
    pub deps: DepsKind,
    pub msvc_deps_prefix: Option<String>,
    pub restat: bool,
    pub generator: bool,
    pub weight: usize,

    // Per-build state below; cleared by State::reset.
    pub mark: VisitMark,
    pub outputs_ready: bool,
    pub deps_loaded: bool,
    pub deps_missing: bool,
    /// Longest downstream duration chain, for ready-queue ordering.
    pub critical_time_ms: i64,
}

impl Edge {
    pub fn is_phony(&self) -> bool {
        self.rule.name == PHONY_RULE
    }

    /// Inputs that contribute to dirtiness: explicit and implicit, but not
    /// order-only.
    pub fn dirtying_ins(&self) -> &[NodeId] {
        &self.inputs[..self.explicit_ins + self.implicit_ins]
    }

    pub fn order_only_ins(&self) -> &[NodeId] {
        &self.inputs[self.explicit_ins + self.implicit_ins..]
    }

    pub fn is_order_only(&self, input_index: usize) -> bool {
        input_index >= self.explicit_ins + self.implicit_ins
    }

    /// The output whose build-log and deps-log records represent the edge.
    pub fn primary_output(&self) -> Option<NodeId> {
        self.outputs.first().copied()
    }

    /// The command string that gets hashed into the build log.  Includes the
    /// response file content, which is part of the effective command.
    pub fn command_for_log(&self) -> String {
        let command = self.cmdline.clone().unwrap_or_default();
        match &self.rspfile {
            Some(rsp) => format!("{};rspfile={}", command, rsp.content),
            None => command,
        }
    }

    fn reset(&mut self) {
        self.mark = VisitMark::None;
        self.outputs_ready = false;
        self.deps_loaded = false;
        self.deps_missing = false;
        self.critical_time_ms = -1;
    }
}

/// Key for the ready queue and pool delayed sets: highest critical time
/// first, ties broken by edge id so identical graphs schedule identically.
#[derive(Debug, Clone, Copy)]
pub struct EdgePriority {
    pub critical_time_ms: i64,
    pub id: EdgeId,
    pub weight: usize,
}

impl PartialEq for EdgePriority {
    fn eq(&self, other: &Self) -> bool {
        self.critical_time_ms == other.critical_time_ms && self.id == other.id
    }
}
impl Eq for EdgePriority {}
impl Ord for EdgePriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .critical_time_ms
            .cmp(&self.critical_time_ms)
            .then(self.id.cmp(&other.id))
    }
}
impl PartialOrd for EdgePriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A named admission-control bucket limiting concurrently running edges.
/// Depth 0 disables the limit.
#[derive(Debug)]
pub struct Pool {
    pub name: String,
    pub depth: usize,
    current_use: usize,
    delayed: BTreeSet<EdgePriority>,
}

pub const CONSOLE_POOL: &str = "console";

impl Pool {
    pub fn new(name: String, depth: usize) -> Pool {
        Pool {
            name,
            depth,
            current_use: 0,
            delayed: BTreeSet::new(),
        }
    }

    pub fn current_use(&self) -> usize {
        self.current_use
    }

    /// Whether edges must queue through this pool rather than run directly.
    pub fn should_delay_edges(&self) -> bool {
        self.depth != 0
    }

    pub fn edge_scheduled(&mut self, weight: usize) {
        if self.depth != 0 {
            self.current_use += weight;
        }
    }

    pub fn edge_finished(&mut self, weight: usize) {
        if self.depth != 0 {
            debug_assert!(self.current_use >= weight);
            self.current_use -= weight;
        }
    }

    pub fn delay_edge(&mut self, pri: EdgePriority) {
        debug_assert!(self.depth != 0);
        self.delayed.insert(pri);
    }

    /// Move delayed edges into `ready` while they fit within the depth,
    /// accounting for their weight.
    pub fn retrieve_ready_edges(&mut self, ready: &mut BTreeSet<EdgePriority>) {
        while let Some(&pri) = self.delayed.iter().next() {
            if self.current_use + pri.weight > self.depth {
                break;
            }
            self.delayed.remove(&pri);
            self.edge_scheduled(pri.weight);
            ready.insert(pri);
        }
    }
}

/// Owner of the graph: the node table keyed by canonical path, the edge
/// arena, rule and pool registries, and declared default targets.
#[derive(Debug)]
pub struct State {
    pub nodes: DenseMap<NodeId, Node>,
    pub edges: DenseMap<EdgeId, Edge>,
    paths: HashMap<String, NodeId>,
    rules: HashMap<String, Rc<Rule>>,
    pub pools: DenseMap<PoolId, Pool>,
    pool_ids: HashMap<String, PoolId>,
    pub defaults: Vec<NodeId>,
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

impl State {
    pub fn new() -> State {
        let mut state = State {
            nodes: DenseMap::new(),
            edges: DenseMap::new(),
            paths: HashMap::new(),
            rules: HashMap::new(),
            pools: DenseMap::new(),
            pool_ids: HashMap::new(),
            defaults: Vec::new(),
        };
        state.rules.insert(
            PHONY_RULE.to_owned(),
            Rc::new(Rule {
                name: PHONY_RULE.to_owned(),
                bindings: SmallMap::default(),
            }),
        );
        // The default pool is unbounded; the console pool serializes edges
        // that take over the terminal.
        for (name, depth) in [(String::new(), 0), (CONSOLE_POOL.to_owned(), 1)] {
            let id = state.pools.push(Pool::new(name.clone(), depth));
            state.pool_ids.insert(name, id);
        }
        state
    }

    pub fn get_node(&mut self, path: impl Into<String>) -> NodeId {
        let mut path = path.into();
        canonicalize_path_in_place(&mut path);
        if let Some(&id) = self.paths.get(&path) {
            return id;
        }
        let id = self.nodes.push(Node::new(path.clone()));
        self.paths.insert(path, id);
        id
    }

    pub fn lookup_node(&self, path: &str) -> Option<NodeId> {
        let mut path = path.to_owned();
        canonicalize_path_in_place(&mut path);
        self.paths.get(&path).copied()
    }

    /// The known path closest to `path` within edit distance 3, for
    /// "unknown target" diagnostics.
    pub fn spellcheck_node(&self, path: &str) -> Option<&Node> {
        const MAX_VALID_EDIT_DISTANCE: usize = 3;
        let mut min_distance = MAX_VALID_EDIT_DISTANCE + 1;
        let mut result = None;
        for (candidate, &id) in &self.paths {
            let distance = edit_distance(candidate, path, MAX_VALID_EDIT_DISTANCE);
            if distance < min_distance {
                min_distance = distance;
                result = Some(id);
            }
        }
        result.map(|id| self.nodes.get(id))
    }

    pub fn add_rule(&mut self, rule: Rule) -> anyhow::Result<()> {
        if self.rules.contains_key(&rule.name) {
            bail!("duplicate rule '{}'", rule.name);
        }
        self.rules.insert(rule.name.clone(), Rc::new(rule));
        Ok(())
    }

    pub fn lookup_rule(&self, name: &str) -> Option<&Rc<Rule>> {
        self.rules.get(name)
    }

    pub fn add_pool(&mut self, name: String, depth: usize) -> anyhow::Result<PoolId> {
        if self.pool_ids.contains_key(&name) {
            bail!("duplicate pool '{}'", name);
        }
        let id = self.pools.push(Pool::new(name.clone(), depth));
        self.pool_ids.insert(name, id);
        Ok(id)
    }

    pub fn lookup_pool(&self, name: &str) -> Option<PoolId> {
        self.pool_ids.get(name).copied()
    }

    pub fn default_pool(&self) -> PoolId {
        PoolId(0)
    }

    pub fn add_edge(&mut self, rule: Rc<Rule>) -> EdgeId {
        let use_console = false;
        self.edges.push(Edge {
            rule,
            pool: self.default_pool(),
            use_console,
            inputs: Vec::new(),
            explicit_ins: 0,
            implicit_ins: 0,
            order_only_ins: 0,
            outputs: Vec::new(),
            explicit_outs: 0,
            validations: Vec::new(),
            dyndep: None,
            cmdline: None,
            description: None,
            depfile: None,
            rspfile: None,
            deps: DepsKind::None,
            msvc_deps_prefix: None,
            restat: false,
            generator: false,
            weight: 1,
            mark: VisitMark::None,
            outputs_ready: false,
            deps_loaded: false,
            deps_missing: false,
            critical_time_ms: -1,
        })
    }

    pub fn add_in(&mut self, edge: EdgeId, path: impl Into<String>) -> NodeId {
        let node = self.get_node(path);
        self.edges.get_mut(edge).inputs.push(node);
        self.nodes.get_mut(node).out_edges.push(edge);
        node
    }

    /// Attach an output; errors if another edge already produces this path.
    pub fn add_out(&mut self, edge: EdgeId, path: impl Into<String>) -> anyhow::Result<NodeId> {
        let node = self.get_node(path);
        if self.nodes.get(node).in_edge.is_some() {
            bail!(
                "multiple rules generate {}",
                self.nodes.get(node).path
            );
        }
        self.edges.get_mut(edge).outputs.push(node);
        self.nodes.get_mut(node).in_edge = Some(edge);
        Ok(node)
    }

    pub fn add_validation(&mut self, edge: EdgeId, path: impl Into<String>) -> NodeId {
        let node = self.get_node(path);
        self.edges.get_mut(edge).validations.push(node);
        self.nodes.get_mut(node).validation_out_edges.push(edge);
        node
    }

    pub fn add_default(&mut self, path: &str) -> anyhow::Result<()> {
        let node = match self.lookup_node(path) {
            Some(node) => node,
            None => bail!("unknown target '{}'", path),
        };
        self.defaults.push(node);
        Ok(())
    }

    /// Nodes nothing consumes: the natural build targets when no defaults
    /// are declared.
    pub fn root_nodes(&self) -> anyhow::Result<Vec<NodeId>> {
        let mut roots = Vec::new();
        for edge in self.edges.values() {
            for &output in &edge.outputs {
                if self.nodes.get(output).out_edges.is_empty() {
                    roots.push(output);
                }
            }
        }
        if !self.edges.is_empty() && roots.is_empty() {
            bail!("could not determine root nodes of build graph");
        }
        Ok(roots)
    }

    pub fn default_nodes(&self) -> anyhow::Result<Vec<NodeId>> {
        if self.defaults.is_empty() {
            self.root_nodes()
        } else {
            Ok(self.defaults.clone())
        }
    }

    /// Clear per-build state so the graph can be rescanned from scratch.
    pub fn reset(&mut self) {
        for node in self.nodes.values_mut() {
            node.reset();
        }
        for edge in self.edges.values_mut() {
            edge.reset();
        }
    }

    pub fn node_path(&self, id: NodeId) -> &str {
        &self.nodes.get(id).path
    }

    /// Check the node/edge cross-link invariants; test support.
    #[cfg(test)]
    pub fn verify_graph(&self) {
        for (id, edge) in self.edges.iter() {
            assert!(!edge.outputs.is_empty(), "edge without outputs");
            for &input in &edge.inputs {
                assert!(self.nodes.get(input).out_edges.contains(&id));
            }
            for &output in &edge.outputs {
                assert_eq!(self.nodes.get(output).in_edge, Some(id));
            }
        }
    }
}

/// Levenshtein distance with early exit once `max_distance` is exceeded.
pub fn edit_distance(a: &str, b: &str, max_distance: usize) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max_distance {
        return max_distance + 1;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row: Vec<usize> = vec![0; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        row[0] = i + 1;
        let mut best = row[0];
        for (j, &cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            row[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(row[j] + 1);
            best = best.min(row[j + 1]);
        }
        if best > max_distance {
            return max_distance + 1;
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat_rule() -> Rule {
        Rule {
            name: "cat".to_owned(),
            bindings: SmallMap::default(),
        }
    }

    #[test]
    fn node_edge_links() {
        let mut state = State::new();
        let rule = Rc::new(cat_rule());
        let edge = state.add_edge(rule);
        let input = state.add_in(edge, "in");
        let output = state.add_out(edge, "out").unwrap();
        state.edges.get_mut(edge).explicit_ins = 1;
        state.edges.get_mut(edge).explicit_outs = 1;

        assert_eq!(state.nodes.get(output).in_edge, Some(edge));
        assert!(state.nodes.get(input).out_edges.contains(&edge));
        state.verify_graph();
    }

    #[test]
    fn duplicate_output_rejected() {
        let mut state = State::new();
        let rule = Rc::new(cat_rule());
        let a = state.add_edge(rule.clone());
        state.add_out(a, "out").unwrap();
        let b = state.add_edge(rule);
        let err = state.add_out(b, "out").unwrap_err();
        assert!(err.to_string().contains("multiple rules generate out"));
    }

    #[test]
    fn paths_are_canonicalized_to_one_node() {
        let mut state = State::new();
        let a = state.get_node("foo/./bar");
        let b = state.get_node("foo//bar");
        assert_eq!(a, b);
        assert_eq!(state.lookup_node("foo/baz/../bar"), Some(a));
    }

    #[test]
    fn defaults_fall_back_to_roots() {
        let mut state = State::new();
        let rule = Rc::new(cat_rule());
        let edge = state.add_edge(rule);
        state.add_in(edge, "in");
        let out = state.add_out(edge, "out").unwrap();
        assert_eq!(state.default_nodes().unwrap(), vec![out]);

        state.add_default("out").unwrap();
        assert_eq!(state.default_nodes().unwrap(), vec![out]);
        assert!(state.add_default("nonesuch").is_err());
    }

    #[test]
    fn reset_clears_scan_state() {
        let mut state = State::new();
        let rule = Rc::new(cat_rule());
        let edge = state.add_edge(rule);
        let out = state.add_out(edge, "out").unwrap();
        state.nodes.get_mut(out).set_dirty(true);
        state.edges.get_mut(edge).mark = VisitMark::Done;
        state.edges.get_mut(edge).outputs_ready = true;
        state.reset();
        assert_eq!(state.nodes.get(out).status, NodeStatus::Unknown);
        assert_eq!(state.edges.get(edge).mark, VisitMark::None);
        assert!(!state.edges.get(edge).outputs_ready);
    }

    #[test]
    fn spellcheck() {
        let mut state = State::new();
        state.get_node("subdir/target");
        state.get_node("other");
        let found = state.spellcheck_node("subdir/targte").unwrap();
        assert_eq!(found.path, "subdir/target");
        assert!(state.spellcheck_node("completely-different").is_none());
    }

    #[test]
    fn edit_distances() {
        assert_eq!(edit_distance("ninja", "ninja", 3), 0);
        assert_eq!(edit_distance("ninja", "nnja", 3), 1);
        assert_eq!(edit_distance("kitten", "sitting", 10), 3);
        // Early exit reports max+1 once unreachable.
        assert_eq!(edit_distance("aaaa", "bbbb", 2), 3);
        assert_eq!(edit_distance("long-name", "x", 3), 4);
    }

    #[test]
    fn pool_admission() {
        let mut pool = Pool::new("link".to_owned(), 2);
        let pri = |i: usize| EdgePriority {
            critical_time_ms: 0,
            id: EdgeId(i),
            weight: 1,
        };
        pool.delay_edge(pri(0));
        pool.delay_edge(pri(1));
        pool.delay_edge(pri(2));
        let mut ready = BTreeSet::new();
        pool.retrieve_ready_edges(&mut ready);
        assert_eq!(ready.len(), 2);
        assert_eq!(pool.current_use(), 2);

        pool.edge_finished(1);
        let mut more = BTreeSet::new();
        pool.retrieve_ready_edges(&mut more);
        assert_eq!(more.len(), 1);
        assert_eq!(pool.current_use(), 2);
    }

    #[test]
    fn pool_priority_order() {
        let mut pool = Pool::new("link".to_owned(), 1);
        pool.delay_edge(EdgePriority {
            critical_time_ms: 5,
            id: EdgeId(7),
            weight: 1,
        });
        pool.delay_edge(EdgePriority {
            critical_time_ms: 50,
            id: EdgeId(9),
            weight: 1,
        });
        let mut ready = BTreeSet::new();
        pool.retrieve_ready_edges(&mut ready);
        // The longer critical path is admitted first.
        assert_eq!(ready.iter().next().unwrap().id, EdgeId(9));
    }
}
