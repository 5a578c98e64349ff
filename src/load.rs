//! Graph loading: parses manifest files and folds their statements into a
//! `State`, evaluating variable bindings along the way.
//!
//! Scoping: top-level bindings accumulate into one scope that flows through
//! `include`; `subninja` files see a snapshot of the scope and their own
//! bindings don't leak back out.  A build statement's variables shadow the
//! rule's bindings, which shadow the top-level scope.

use crate::disk::DiskInterface;
use crate::eval::{Env, EvalString};
use crate::graph::{self, DepsKind, RspFile, State, CONSOLE_POOL};
use crate::parse::{self, Parser, Statement};
use crate::smallmap::SmallMap;
use anyhow::{anyhow, bail};
use std::path::Path;

/// A loaded graph plus the bits of top-level scope the driver needs.
#[derive(Debug)]
pub struct LoadedState {
    pub state: State,
    /// Value of the top-level `builddir` binding, where side logs live.
    pub builddir: Option<String>,
}

/// Parse `build_filename` (and anything it includes) into a fresh State.
pub fn read(disk: &dyn DiskInterface, build_filename: &str) -> anyhow::Result<LoadedState> {
    let mut loader = Loader {
        disk,
        state: State::new(),
        globals: SmallMap::default(),
    };
    loader.read_file(build_filename)?;
    let builddir = loader.globals.get("builddir").cloned();
    Ok(LoadedState {
        state: loader.state,
        builddir,
    })
}

struct Loader<'a> {
    disk: &'a dyn DiskInterface,
    state: State,
    globals: SmallMap<String, String>,
}

/// The implicit per-edge bindings: `$in`, `$in_newline`, `$out`.
struct ImplicitVars {
    ins: String,
    ins_newline: String,
    outs: String,
}

impl Env for ImplicitVars {
    fn get_var(&self, var: &str) -> Option<std::borrow::Cow<str>> {
        match var {
            "in" => Some(std::borrow::Cow::Borrowed(&self.ins)),
            "in_newline" => Some(std::borrow::Cow::Borrowed(&self.ins_newline)),
            "out" => Some(std::borrow::Cow::Borrowed(&self.outs)),
            _ => None,
        }
    }
}

fn truthy(value: Option<&String>) -> bool {
    value.is_some_and(|v| !v.is_empty())
}

impl Loader<'_> {
    fn read_file(&mut self, path: &str) -> anyhow::Result<()> {
        let mut bytes = self
            .disk
            .read_file(path)
            .map_err(|err| anyhow!("read {}: {}", path, err))?;
        bytes.push(0);
        self.parse(path, &bytes)
    }

    fn parse(&mut self, filename: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let mut parser = Parser::new(bytes);
        loop {
            let stmt = match parser.read() {
                Err(err) => bail!(parser.format_parse_error(Path::new(filename), err)),
                Ok(None) => break,
                Ok(Some(stmt)) => stmt,
            };
            match stmt {
                Statement::Binding((name, value)) => {
                    let value = value.evaluate(&[&self.globals]);
                    self.globals.insert(name.to_owned(), value);
                }
                Statement::Rule(rule) => {
                    let mut bindings: SmallMap<String, EvalString<String>> = SmallMap::default();
                    for (name, value) in rule.vars.into_iter() {
                        bindings.insert(name.to_owned(), value.into_owned());
                    }
                    self.state
                        .add_rule(graph::Rule {
                            name: rule.name.to_owned(),
                            bindings,
                        })
                        .map_err(|err| anyhow!("{}: {}", filename, err))?;
                }
                Statement::Build(build) => self.add_build(filename, build)?,
                Statement::Default(defaults) => {
                    for default in defaults {
                        let path = default.evaluate(&[&self.globals]);
                        self.state
                            .add_default(&path)
                            .map_err(|err| anyhow!("{}: {}", filename, err))?;
                    }
                }
                Statement::Include(include) => {
                    let path = include.evaluate(&[&self.globals]);
                    self.read_file(&path)?;
                }
                Statement::Subninja(subninja) => {
                    let path = subninja.evaluate(&[&self.globals]);
                    let saved = self.globals.clone();
                    self.read_file(&path)?;
                    self.globals = saved;
                }
                Statement::Pool(pool) => {
                    self.state
                        .add_pool(pool.name.to_owned(), pool.depth)
                        .map_err(|err| anyhow!("{}: {}", filename, err))?;
                }
            }
        }
        Ok(())
    }

    fn add_build(&mut self, filename: &str, build: parse::Build) -> anyhow::Result<()> {
        let rule = match self.state.lookup_rule(build.rule) {
            Some(rule) => rule.clone(),
            None => bail!("{}:{}: unknown rule '{}'", filename, build.line, build.rule),
        };

        // The build's own bindings come first; they're in scope for paths
        // and shadow the rule's bindings.
        let mut build_vars: SmallMap<String, String> = SmallMap::default();
        for (name, value) in build.vars.iter() {
            let value = value.evaluate(&[&build_vars, &self.globals]);
            build_vars.insert((*name).to_owned(), value);
        }

        let outs: Vec<String> = build
            .outs
            .iter()
            .map(|path| path.evaluate(&[&build_vars, &self.globals]))
            .collect();
        let ins: Vec<String> = build
            .ins
            .iter()
            .map(|path| path.evaluate(&[&build_vars, &self.globals]))
            .collect();

        let implicit = ImplicitVars {
            ins: ins[..build.explicit_ins].join(" "),
            ins_newline: ins[..build.explicit_ins].join("\n"),
            outs: outs[..build.explicit_outs].join(" "),
        };
        let envs: [&dyn Env; 4] = [&implicit, &build_vars, &rule.bindings, &self.globals];
        // An edge binding: the build statement's value wins, then the rule
        // template expanded against the edge's scope, then the outer scope.
        let binding = |name: &str| -> Option<String> {
            if let Some(value) = build_vars.get(name) {
                return Some(value.clone());
            }
            if let Some(template) = rule.bindings.get(name) {
                return Some(template.evaluate(&envs));
            }
            self.globals.get(name).cloned()
        };

        let cmdline = binding("command");
        let description = binding("description").filter(|d| !d.is_empty());
        let depfile = binding("depfile").filter(|d| !d.is_empty());
        let deps = match binding("deps").as_deref() {
            None | Some("") => DepsKind::None,
            Some("gcc") => DepsKind::Gcc,
            Some("msvc") => DepsKind::Msvc,
            Some(other) => bail!("{}:{}: unknown deps style '{}'", filename, build.line, other),
        };
        let msvc_deps_prefix = binding("msvc_deps_prefix").filter(|p| !p.is_empty());
        let restat = truthy(binding("restat").as_ref());
        let generator = truthy(binding("generator").as_ref());
        let rspfile = match (binding("rspfile"), binding("rspfile_content")) {
            (Some(path), Some(content)) if !path.is_empty() => Some(RspFile { path, content }),
            _ => None,
        };
        let pool_name = binding("pool").unwrap_or_default();
        let pool = if pool_name.is_empty() {
            self.state.default_pool()
        } else {
            match self.state.lookup_pool(&pool_name) {
                Some(pool) => pool,
                None => bail!(
                    "{}:{}: unknown pool name '{}'",
                    filename,
                    build.line,
                    pool_name
                ),
            }
        };
        let dyndep_path = binding("dyndep").filter(|d| !d.is_empty());

        let edge = self.state.add_edge(rule.clone());
        for out in &outs {
            self.state
                .add_out(edge, out.clone())
                .map_err(|err| anyhow!("{}:{}: {}", filename, build.line, err))?;
        }
        let input_count = build.explicit_ins + build.implicit_ins + build.order_only_ins;
        for input in &ins[..input_count] {
            self.state.add_in(edge, input.clone());
        }
        for validation in &ins[input_count..] {
            self.state.add_validation(edge, validation.clone());
        }

        {
            let e = self.state.edges.get_mut(edge);
            e.explicit_outs = build.explicit_outs;
            e.explicit_ins = build.explicit_ins;
            e.implicit_ins = build.implicit_ins;
            e.order_only_ins = build.order_only_ins;
            e.cmdline = if rule.name == graph::PHONY_RULE {
                None
            } else {
                Some(cmdline.unwrap_or_default())
            };
            e.description = description;
            e.depfile = depfile;
            e.deps = deps;
            e.msvc_deps_prefix = msvc_deps_prefix;
            e.restat = restat;
            e.generator = generator;
            e.rspfile = rspfile;
            e.pool = pool;
            e.use_console = pool_name == CONSOLE_POOL;
        }

        if let Some(dyndep_path) = dyndep_path {
            let node = self.state.get_node(dyndep_path.clone());
            if !self.state.edges.get(edge).inputs.contains(&node) {
                bail!(
                    "{}:{}: dyndep '{}' is not an input",
                    filename,
                    build.line,
                    dyndep_path
                );
            }
            self.state.edges.get_mut(edge).dyndep = Some(node);
            self.state.nodes.get_mut(node).dyndep_pending = true;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::VirtualDisk;

    fn load(manifest: &str) -> anyhow::Result<LoadedState> {
        let disk = VirtualDisk::new();
        disk.create("build.ninja", manifest);
        read(&disk, "build.ninja")
    }

    fn must_load(manifest: &str) -> LoadedState {
        match load(manifest) {
            Ok(loaded) => loaded,
            Err(err) => panic!("load failed: {}", err),
        }
    }

    #[test]
    fn basic_rule_and_build() {
        let loaded = must_load(
            "rule cat\n  command = cat $in > $out\nbuild out: cat in1 in2\n",
        );
        let state = loaded.state;
        let out = state.lookup_node("out").unwrap();
        let edge = state.nodes.get(out).in_edge.unwrap();
        let e = state.edges.get(edge);
        assert_eq!(e.cmdline.as_deref(), Some("cat in1 in2 > out"));
        assert_eq!(e.explicit_ins, 2);
        assert!(!e.is_phony());
    }

    #[test]
    fn build_vars_shadow_rule_bindings() {
        let loaded = must_load(
            "flags = -O0\nrule cc\n  command = cc $flags $in -o $out\nbuild a.o: cc a.c\n  flags = -O2\nbuild b.o: cc b.c\n",
        );
        let state = loaded.state;
        let a = state.lookup_node("a.o").unwrap();
        let a_edge = state.nodes.get(a).in_edge.unwrap();
        assert_eq!(
            state.edges.get(a_edge).cmdline.as_deref(),
            Some("cc -O2 a.c -o a.o")
        );
        let b = state.lookup_node("b.o").unwrap();
        let b_edge = state.nodes.get(b).in_edge.unwrap();
        assert_eq!(
            state.edges.get(b_edge).cmdline.as_deref(),
            Some("cc -O0 b.c -o b.o")
        );
    }

    #[test]
    fn input_partitions() {
        let loaded = must_load(
            "rule r\n  command = r\nbuild out | out.imp: r in | dep1 || order1 |@ check\nbuild check: r other\n",
        );
        let state = loaded.state;
        let out = state.lookup_node("out").unwrap();
        let edge = state.nodes.get(out).in_edge.unwrap();
        let e = state.edges.get(edge);
        assert_eq!(e.outputs.len(), 2);
        assert_eq!(e.explicit_outs, 1);
        assert_eq!((e.explicit_ins, e.implicit_ins, e.order_only_ins), (1, 1, 1));
        assert_eq!(e.validations.len(), 1);
        let check = state.lookup_node("check").unwrap();
        assert!(state
            .nodes
            .get(check)
            .validation_out_edges
            .contains(&edge));
    }

    #[test]
    fn phony_rule_is_builtin() {
        let loaded = must_load("build alias: phony real\n");
        let state = loaded.state;
        let alias = state.lookup_node("alias").unwrap();
        let edge = state.nodes.get(alias).in_edge.unwrap();
        assert!(state.edges.get(edge).is_phony());
        assert!(state.edges.get(edge).cmdline.is_none());
    }

    #[test]
    fn special_bindings_are_extracted() {
        let loaded = must_load(
            "rule cc\n  command = cc $in\n  depfile = $out.d\n  deps = gcc\n  restat = 1\n  generator = 1\n  rspfile = $out.rsp\n  rspfile_content = $in\nbuild a.o: cc a.c\n",
        );
        let state = loaded.state;
        let out = state.lookup_node("a.o").unwrap();
        let e = state.edges.get(state.nodes.get(out).in_edge.unwrap());
        assert_eq!(e.depfile.as_deref(), Some("a.o.d"));
        assert_eq!(e.deps, DepsKind::Gcc);
        assert!(e.restat);
        assert!(e.generator);
        let rsp = e.rspfile.as_ref().unwrap();
        assert_eq!(rsp.path, "a.o.rsp");
        assert_eq!(rsp.content, "a.c");
    }

    #[test]
    fn unknown_deps_style_is_an_error() {
        let err = load("rule cc\n  command = cc\n  deps = wild\nbuild a.o: cc a.c\n").unwrap_err();
        assert!(err.to_string().contains("unknown deps style"));
    }

    #[test]
    fn pools_and_console() {
        let loaded = must_load(
            "pool heavy\n  depth = 2\nrule link\n  command = link\n  pool = heavy\nrule deploy\n  command = deploy\n  pool = console\nbuild app: link a.o\nbuild it: deploy app\n",
        );
        let state = loaded.state;
        let app = state.lookup_node("app").unwrap();
        let app_edge = state.nodes.get(app).in_edge.unwrap();
        let heavy = state.lookup_pool("heavy").unwrap();
        assert_eq!(state.edges.get(app_edge).pool, heavy);
        assert_eq!(state.pools.get(heavy).depth, 2);

        let it = state.lookup_node("it").unwrap();
        let it_edge = state.nodes.get(it).in_edge.unwrap();
        assert!(state.edges.get(it_edge).use_console);
    }

    #[test]
    fn unknown_pool_is_an_error() {
        let err = load("rule r\n  command = r\n  pool = nope\nbuild out: r in\n").unwrap_err();
        assert!(err.to_string().contains("unknown pool name 'nope'"));
    }

    #[test]
    fn duplicate_output_is_fatal() {
        let err = load("rule r\n  command = r\nbuild out: r a\nbuild out: r b\n").unwrap_err();
        assert!(err.to_string().contains("multiple rules generate out"));
    }

    #[test]
    fn defaults_are_recorded() {
        let loaded = must_load("rule r\n  command = r\nbuild out: r in\ndefault out\n");
        let state = loaded.state;
        let out = state.lookup_node("out").unwrap();
        assert_eq!(state.defaults, vec![out]);
    }

    #[test]
    fn include_shares_scope_subninja_does_not() {
        let disk = VirtualDisk::new();
        disk.create("build.ninja", "var = outer\ninclude inc.ninja\nsubninja sub.ninja\nrule r\n  command = r $var\nbuild top: r in\n");
        disk.create("inc.ninja", "var = from-include\n");
        disk.create("sub.ninja", "var = from-sub\nrule sr\n  command = sr $var\nbuild sub-out: sr in\n");
        let loaded = read(&disk, "build.ninja").unwrap();
        let state = loaded.state;

        // The subninja build saw its own binding.
        let sub = state.lookup_node("sub-out").unwrap();
        let sub_edge = state.nodes.get(sub).in_edge.unwrap();
        assert_eq!(state.edges.get(sub_edge).cmdline.as_deref(), Some("sr from-sub"));

        // The top-level build sees the included binding, not the subninja's.
        let top = state.lookup_node("top").unwrap();
        let top_edge = state.nodes.get(top).in_edge.unwrap();
        assert_eq!(
            state.edges.get(top_edge).cmdline.as_deref(),
            Some("r from-include")
        );
    }

    #[test]
    fn dyndep_binding_must_be_an_input() {
        let err = load("rule r\n  command = r\n  dyndep = dd\nbuild out: r in\n").unwrap_err();
        assert!(err.to_string().contains("dyndep 'dd' is not an input"));

        let loaded =
            must_load("rule r\n  command = r\n  dyndep = dd\nbuild out: r in || dd\nbuild dd: r x\n");
        let state = loaded.state;
        let dd = state.lookup_node("dd").unwrap();
        assert!(state.nodes.get(dd).dyndep_pending);
    }

    #[test]
    fn builddir_is_surfaced() {
        let loaded = must_load("builddir = out\nrule r\n  command = r\nbuild o: r i\n");
        assert_eq!(loaded.builddir.as_deref(), Some("out"));
    }

    #[test]
    fn escapes_in_paths() {
        let loaded = must_load("rule r\n  command = r\nbuild with$ space: r in\n");
        assert!(loaded.state.lookup_node("with space").is_some());
    }
}
