//! Removal of generated files, driven by the graph and the build log.

use crate::build_log::BuildLog;
use crate::disk::DiskInterface;
use crate::dyndep;
use crate::graph::{NodeId, State};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanerOptions {
    pub verbose: bool,
    pub dry_run: bool,
}

pub struct Cleaner<'a> {
    state: &'a mut State,
    disk: &'a dyn DiskInterface,
    options: CleanerOptions,
    cleaned_files_count: usize,
    removed: HashSet<String>,
    cleaned: HashSet<NodeId>,
    status: i32,
}

impl<'a> Cleaner<'a> {
    pub fn new(state: &'a mut State, disk: &'a dyn DiskInterface, options: CleanerOptions) -> Self {
        Cleaner {
            state,
            disk,
            options,
            cleaned_files_count: 0,
            removed: HashSet::new(),
            cleaned: HashSet::new(),
            status: 0,
        }
    }

    pub fn cleaned_files_count(&self) -> usize {
        self.cleaned_files_count
    }

    fn file_exists(&mut self, path: &str) -> bool {
        match self.disk.stat(path) {
            Ok(mtime) => mtime.exists(),
            Err(err) => {
                eprintln!("joist: error: {}", err);
                self.status = 1;
                false
            }
        }
    }

    fn report(&mut self, path: &str) {
        self.cleaned_files_count += 1;
        if self.options.verbose {
            println!("Remove {}", path);
        }
    }

    fn remove(&mut self, path: &str) {
        if !self.removed.insert(path.to_owned()) {
            return;
        }
        if self.options.dry_run {
            if self.file_exists(path) {
                self.report(path);
            }
        } else {
            match self.disk.remove_file(path) {
                Ok(true) => self.report(path),
                Ok(false) => {}
                Err(err) => {
                    eprintln!("joist: error: {}", err);
                    self.status = 1;
                }
            }
        }
    }

    /// Remove an edge's auxiliary files (depfile, response file).
    fn remove_edge_files(&mut self, edge: crate::graph::EdgeId) {
        let (depfile, rspfile) = {
            let e = self.state.edges.get(edge);
            (
                e.depfile.clone(),
                e.rspfile.as_ref().map(|rsp| rsp.path.clone()),
            )
        };
        if let Some(depfile) = depfile {
            self.remove(&depfile);
        }
        if let Some(rspfile) = rspfile {
            self.remove(&rspfile);
        }
    }

    fn print_header(&self) {
        if self.options.verbose {
            println!("Cleaning...");
        } else {
            print!("Cleaning... ");
        }
    }

    fn print_footer(&self) {
        println!("{} files.", self.cleaned_files_count);
    }

    /// Load dyndep files that exist, before they are cleaned, so their
    /// extra outputs are known.  Errors are ignored; we clean as much of
    /// the graph as we know.
    fn load_dyndeps(&mut self) {
        let dyndep_nodes: Vec<NodeId> = self
            .state
            .edges
            .values()
            .filter_map(|edge| edge.dyndep)
            .collect();
        for node in dyndep_nodes {
            if self.state.nodes.get(node).dyndep_pending {
                let _ = dyndep::load_dyndeps(self.state, self.disk, node);
            }
        }
    }

    /// Remove every generated file.  Phony edges produce nothing; generator
    /// edges are kept unless asked for.
    pub fn clean_all(&mut self, generator: bool) -> i32 {
        self.print_header();
        self.load_dyndeps();
        for edge in self.state.edges.ids().collect::<Vec<_>>() {
            let (phony, is_generator, outputs) = {
                let e = self.state.edges.get(edge);
                (e.is_phony(), e.generator, e.outputs.clone())
            };
            if phony {
                continue;
            }
            if !generator && is_generator {
                continue;
            }
            for output in outputs {
                let path = self.state.node_path(output).to_owned();
                self.remove(&path);
            }
            self.remove_edge_files(edge);
        }
        self.print_footer();
        self.status
    }

    /// Remove build-log outputs that are no longer part of the graph.
    pub fn clean_dead(&mut self, build_log: &BuildLog) -> i32 {
        self.print_header();
        let mut outputs: Vec<&String> = build_log.entries().keys().collect();
        outputs.sort();
        for output in outputs {
            // An output is stale when it has no node at all, or its node is
            // connected to no edge (a leftover from an old deps log).
            let stale = match self.state.lookup_node(output) {
                None => true,
                Some(node) => {
                    let n = self.state.nodes.get(node);
                    n.in_edge.is_none() && n.out_edges.is_empty()
                }
            };
            if stale {
                let output = output.clone();
                self.remove(&output);
            }
        }
        self.print_footer();
        self.status
    }

    fn do_clean_target(&mut self, target: NodeId) {
        if let Some(edge) = self.state.nodes.get(target).in_edge {
            if !self.state.edges.get(edge).is_phony() {
                let path = self.state.node_path(target).to_owned();
                self.remove(&path);
                self.remove_edge_files(edge);
            }
            for input in self.state.edges.get(edge).inputs.clone() {
                if !self.cleaned.contains(&input) {
                    self.do_clean_target(input);
                }
            }
        }
        self.cleaned.insert(target);
    }

    /// Remove the named targets and everything built to make them.
    pub fn clean_targets(&mut self, targets: &[String]) -> i32 {
        self.print_header();
        self.load_dyndeps();
        for target in targets {
            match self.state.lookup_node(target) {
                Some(node) => {
                    if self.options.verbose {
                        println!("Target {}", target);
                    }
                    self.do_clean_target(node);
                }
                None => {
                    eprintln!("joist: error: unknown target '{}'", target);
                    self.status = 1;
                }
            }
        }
        self.print_footer();
        self.status
    }

    fn do_clean_rule(&mut self, rule: &str) {
        for edge in self.state.edges.ids().collect::<Vec<_>>() {
            if self.state.edges.get(edge).rule.name != rule {
                continue;
            }
            for output in self.state.edges.get(edge).outputs.clone() {
                let path = self.state.node_path(output).to_owned();
                self.remove(&path);
            }
            self.remove_edge_files(edge);
        }
    }

    /// Remove all outputs of edges using the named rules.
    pub fn clean_rules(&mut self, rules: &[String]) -> i32 {
        self.print_header();
        self.load_dyndeps();
        for rule in rules {
            if self.state.lookup_rule(rule).is_some() {
                if self.options.verbose {
                    println!("Rule {}", rule);
                }
                self.do_clean_rule(rule);
            } else {
                eprintln!("joist: error: unknown rule '{}'", rule);
                self.status = 1;
            }
        }
        self.print_footer();
        self.status
    }
}
