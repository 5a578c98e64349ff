//! Dynamic dependencies: a file, itself produced by the graph, whose
//! contents extend another edge's inputs and outputs once it exists.
//!
//! Dyndep files use manifest syntax with a version binding and `build`
//! statements naming the `dyndep` pseudo-rule:
//!
//! ```text
//! ninja_dyndep_version = 1
//! build out | extra.out: dyndep | extra.in
//!   restat = 1
//! ```

use crate::disk::DiskInterface;
use crate::graph::{EdgeId, NodeId, State};
use crate::parse::{Parser, Statement};
use crate::smallmap::SmallMap;
use anyhow::{anyhow, bail};
use std::path::Path;

/// One edge's worth of dyndep content.
#[derive(Debug, Default)]
pub struct Dyndeps {
    pub restat: bool,
    pub implicit_inputs: Vec<NodeId>,
    pub implicit_outputs: Vec<NodeId>,
}

/// Load a dyndep file and fold its content into the edges that declared it.
/// Idempotent: the node's pending flag is cleared, and callers check it.
/// Returns the per-edge updates so the plan can pick up new inputs mid-build.
pub fn load_dyndeps(
    state: &mut State,
    disk: &dyn DiskInterface,
    dyndep_node: NodeId,
) -> anyhow::Result<Vec<(EdgeId, Dyndeps)>> {
    let path = state.node_path(dyndep_node).to_owned();
    let mut contents = disk
        .read_file(&path)
        .map_err(|err| anyhow!("loading '{}': {}", path, err))?;
    contents.push(0);

    let updates = parse_dyndep_file(state, dyndep_node, &path, &contents)?;

    state.nodes.get_mut(dyndep_node).dyndep_pending = false;

    // Every edge that names this dyndep file must be covered by it.
    let consumers: Vec<EdgeId> = state.nodes.get(dyndep_node).out_edges.clone();
    for edge in consumers {
        if state.edges.get(edge).dyndep != Some(dyndep_node) {
            continue;
        }
        if !updates.iter().any(|(e, _)| *e == edge) {
            let out = state.edges.get(edge).primary_output();
            bail!(
                "'{}' not mentioned in its dyndep file '{}'",
                out.map(|o| state.node_path(o)).unwrap_or("?"),
                path
            );
        }
    }

    Ok(updates)
}

fn parse_dyndep_file(
    state: &mut State,
    dyndep_node: NodeId,
    path: &str,
    contents: &[u8],
) -> anyhow::Result<Vec<(EdgeId, Dyndeps)>> {
    let mut parser = Parser::new(contents);
    let mut updates: Vec<(EdgeId, Dyndeps)> = Vec::new();
    let mut vars: SmallMap<String, String> = SmallMap::default();

    loop {
        let stmt = match parser.read() {
            Ok(None) => break,
            Ok(Some(stmt)) => stmt,
            Err(err) => bail!(parser.format_parse_error(Path::new(path), err)),
        };
        let build = match stmt {
            Statement::Build(build) => build,
            Statement::Binding((name, value)) => {
                let value = value.evaluate(&[&vars]);
                vars.insert(name.to_owned(), value);
                continue;
            }
            _ => bail!("{}: unexpected statement in dyndep file", path),
        };

        match vars.get("ninja_dyndep_version").map(|v| v.as_str()) {
            Some("1") | Some("1.0") => {}
            Some(version) => bail!("{}: unsupported dyndep version {:?}", path, version),
            None => bail!("{}: expected 'ninja_dyndep_version = ...'", path),
        }

        if build.rule != "dyndep" {
            bail!("{}: expected rule 'dyndep', got '{}'", path, build.rule);
        }
        if build.explicit_outs != 1 {
            bail!("{}: expected exactly one explicit output", path);
        }
        if build.explicit_ins != 0 || build.order_only_ins != 0 || build.validation_ins != 0 {
            bail!("{}: only implicit ('|') inputs are allowed", path);
        }

        let out_path = build.outs[0].evaluate(&[&vars]);
        let out_node = match state.lookup_node(&out_path) {
            Some(node) => node,
            None => bail!("{}: no build statement exists for '{}'", path, out_path),
        };
        let edge = match state.nodes.get(out_node).in_edge {
            Some(edge) => edge,
            None => bail!("{}: no build statement exists for '{}'", path, out_path),
        };
        if state.edges.get(edge).dyndep != Some(dyndep_node) {
            bail!(
                "{}: build statement for '{}' does not bind this dyndep file",
                path,
                out_path
            );
        }
        if updates.iter().any(|(e, _)| *e == edge) {
            bail!("{}: multiple statements for '{}'", path, out_path);
        }

        let mut dyndeps = Dyndeps {
            restat: build
                .vars
                .get("restat")
                .map(|v| !v.evaluate(&[&vars]).is_empty())
                .unwrap_or(false),
            implicit_inputs: Vec::new(),
            implicit_outputs: Vec::new(),
        };
        for out in &build.outs[1..] {
            let node = state.get_node(out.evaluate(&[&vars]));
            dyndeps.implicit_outputs.push(node);
        }
        for input in &build.ins {
            let node = state.get_node(input.evaluate(&[&vars]));
            dyndeps.implicit_inputs.push(node);
        }

        update_edge(state, edge, &dyndeps)?;
        updates.push((edge, dyndeps));
    }

    if updates.is_empty() {
        // Still require the version binding for an empty file.
        match vars.get("ninja_dyndep_version") {
            Some(_) => {}
            None => bail!("{}: expected 'ninja_dyndep_version = ...'", path),
        }
    }

    Ok(updates)
}

/// Graft a dyndep statement's content onto its edge.
fn update_edge(state: &mut State, edge_id: EdgeId, dyndeps: &Dyndeps) -> anyhow::Result<()> {
    if dyndeps.restat {
        state.edges.get_mut(edge_id).restat = true;
    }
    for &out in &dyndeps.implicit_outputs {
        if let Some(other) = state.nodes.get(out).in_edge {
            if other != edge_id {
                bail!("multiple rules generate {}", state.node_path(out));
            }
            continue;
        }
        state.nodes.get_mut(out).in_edge = Some(edge_id);
        state.edges.get_mut(edge_id).outputs.push(out);
    }
    if !dyndeps.implicit_inputs.is_empty() {
        {
            let edge = state.edges.get_mut(edge_id);
            let pos = edge.explicit_ins + edge.implicit_ins;
            edge.inputs.splice(pos..pos, dyndeps.implicit_inputs.iter().copied());
            edge.implicit_ins += dyndeps.implicit_inputs.len();
        }
        for &input in &dyndeps.implicit_inputs {
            state.nodes.get_mut(input).out_edges.push(edge_id);
        }
    }
    Ok(())
}
