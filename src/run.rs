//! Command-line entry point: flag parsing, tool dispatch, and the outer
//! build loop (including regenerating the manifest when it is itself a
//! build target).

use crate::build_log::{BuildLog, BuildLogUser};
use crate::clean::{Cleaner, CleanerOptions};
use crate::deps_log::DepsLog;
use crate::disk::{DiskInterface, RealDisk};
use crate::graph::State;
use crate::load;
use crate::signal;
use crate::status::{Status, StatusPrinter, Verbosity};
use crate::trace;
use crate::work::{self, Interrupted, Work};
use anyhow::{anyhow, bail};

const BUILD_LOG_FILE: &str = ".ninja_log";
const DEPS_LOG_FILE: &str = ".ninja_deps";

/// A generator that keeps dirtying its own manifest gets cut off here.
const REBUILD_MANIFEST_CYCLE_LIMIT: usize = 100;

#[derive(argh::FromArgs)]
/// joist, a ninja-compatible build system
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// input build file [default=build.ninja]
    #[argh(option, short = 'f', default = "(\"build.ninja\".into())")]
    build_file: String,

    /// debugging tools; use '-d list' to list
    #[argh(option, short = 'd')]
    debug: Option<String>,

    /// subtools; use '-t list' to list
    #[argh(option, short = 't')]
    tool: Option<String>,

    /// parallelism [default uses system thread count]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// keep going until N jobs fail (0 means infinity) [default=1]
    #[argh(option, short = 'k', default = "1")]
    keep_going: usize,

    /// do not start new jobs if the 1-minute load average exceeds N
    #[argh(option, short = 'l', default = "0.0")]
    load_average: f64,

    /// print executed command lines
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// print nothing but command output and errors
    #[argh(switch)]
    quiet: bool,

    /// with -t clean: dry run, report without removing
    #[argh(switch, short = 'n')]
    dry_run: bool,

    /// with -t clean: also remove generator rule outputs
    #[argh(switch, short = 'g')]
    generator: bool,

    /// with -t clean: interpret targets as rule names
    #[argh(switch, short = 'r')]
    rules: bool,

    /// targets to build (or arguments to the selected tool)
    #[argh(positional)]
    targets: Vec<String>,
}

/// How the log paths are derived from the manifest's `builddir` binding.
fn log_paths(disk: &dyn DiskInterface, builddir: &Option<String>) -> anyhow::Result<(String, String)> {
    match builddir {
        Some(dir) if !dir.is_empty() => {
            disk.make_dirs(dir)?;
            Ok((
                format!("{}/{}", dir, BUILD_LOG_FILE),
                format!("{}/{}", dir, DEPS_LOG_FILE),
            ))
        }
        _ => Ok((BUILD_LOG_FILE.to_owned(), DEPS_LOG_FILE.to_owned())),
    }
}

/// Recompaction policy for build log entries: dead when nothing in the
/// current graph produces the path and it is gone from disk.
struct DeadPathChecker<'a> {
    state: &'a State,
    disk: &'a dyn DiskInterface,
}

impl BuildLogUser for DeadPathChecker<'_> {
    fn is_path_dead(&self, path: &str) -> bool {
        let produced = match self.state.lookup_node(path) {
            Some(node) => self.state.nodes.get(node).in_edge.is_some(),
            None => false,
        };
        if produced {
            return false;
        }
        // An old output may still have a node via the deps log; only treat
        // it as dead once it is also gone from disk.
        match self.disk.stat(path) {
            Ok(mtime) => !mtime.exists(),
            Err(_) => false,
        }
    }
}

struct BuildParams<'a> {
    options: work::Options,
    target_names: &'a [String],
    build_filename: &'a str,
}

fn build(
    status: &mut dyn Status,
    disk: &RealDisk,
    params: &BuildParams,
) -> anyhow::Result<Option<usize>> {
    let mut manifest_cycles = 0;
    loop {
        let loaded = trace::scope("load::read", || load::read(disk, params.build_filename))?;
        let mut state = loaded.state;
        let (build_log_path, deps_log_path) = log_paths(disk, &loaded.builddir)?;

        let mut build_log = BuildLog::new();
        build_log.load(&build_log_path)?;
        let mut deps_log = DepsLog::new();
        deps_log.load(&deps_log_path, &mut state)?;
        if deps_log.needs_recompaction() {
            deps_log.recompact(&deps_log_path, &state)?;
        }
        {
            let checker = DeadPathChecker {
                state: &state,
                disk,
            };
            build_log.open_for_write(&build_log_path, &checker)?;
        }
        deps_log.open_for_write(&deps_log_path)?;

        // If the manifest is itself a target, bring it up to date first and
        // reparse when it changed.
        let manifest_node = state
            .lookup_node(params.build_filename)
            .filter(|&node| state.nodes.get(node).in_edge.is_some());
        if let Some(manifest_node) = manifest_node {
            if manifest_cycles >= REBUILD_MANIFEST_CYCLE_LIMIT {
                bail!(
                    "manifest '{}' still dirty after {} tries",
                    params.build_filename,
                    manifest_cycles
                );
            }
            let mut work = Work::new(
                &mut state,
                disk,
                &mut build_log,
                &mut deps_log,
                status,
                &params.options,
            );
            work.want_node(manifest_node)?;
            match trace::scope("work.run", || work.run())? {
                None => return Ok(None),
                Some(0) => {
                    // Manifest already up to date; proceed with this parse.
                }
                Some(_) => {
                    // Regenerated the manifest; reload and start over.
                    manifest_cycles += 1;
                    continue;
                }
            }
        }

        let mut work = Work::new(
            &mut state,
            disk,
            &mut build_log,
            &mut deps_log,
            status,
            &params.options,
        );
        if !params.target_names.is_empty() {
            for name in params.target_names {
                work.want_file(name)?;
            }
        } else {
            let defaults = work.default_nodes()?;
            for node in defaults {
                work.want_node(node)?;
            }
        }
        let result = trace::scope("work.run", || work.run());
        drop(work);
        build_log.close()?;
        deps_log.close();
        return result;
    }
}

/// Parallelism default: core count plus slack to cover blocked processes.
fn default_parallelism() -> anyhow::Result<usize> {
    let processors = std::thread::available_parallelism()?.get();
    Ok(match processors {
        0 | 1 => 2,
        2 => 3,
        n => n + 2,
    })
}

struct Tool {
    name: &'static str,
    desc: &'static str,
    func: fn(&Opts, &RealDisk) -> anyhow::Result<i32>,
}

const TOOLS: &[Tool] = &[
    Tool {
        name: "clean",
        desc: "remove built files (all, named targets, or -r rule names)",
        func: tool_clean,
    },
    Tool {
        name: "cleandead",
        desc: "remove files produced by previous builds that are no longer in the graph",
        func: tool_cleandead,
    },
    Tool {
        name: "restat",
        desc: "re-stat build log entries (optionally restricted to targets)",
        func: tool_restat,
    },
];

fn tool_clean(opts: &Opts, disk: &RealDisk) -> anyhow::Result<i32> {
    let loaded = load::read(disk, &opts.build_file)?;
    let mut state = loaded.state;
    let options = CleanerOptions {
        verbose: opts.verbose,
        dry_run: opts.dry_run,
    };
    let mut cleaner = Cleaner::new(&mut state, disk, options);
    let status = if opts.rules {
        if opts.targets.is_empty() {
            bail!("expected a rule to clean");
        }
        cleaner.clean_rules(&opts.targets)
    } else if !opts.targets.is_empty() {
        cleaner.clean_targets(&opts.targets)
    } else {
        cleaner.clean_all(opts.generator)
    };
    Ok(status)
}

fn tool_cleandead(opts: &Opts, disk: &RealDisk) -> anyhow::Result<i32> {
    let loaded = load::read(disk, &opts.build_file)?;
    let mut state = loaded.state;
    let (build_log_path, deps_log_path) = log_paths(disk, &loaded.builddir)?;
    let mut build_log = BuildLog::new();
    build_log.load(&build_log_path)?;
    let mut deps_log = DepsLog::new();
    deps_log.load(&deps_log_path, &mut state)?;

    let options = CleanerOptions {
        verbose: opts.verbose,
        dry_run: opts.dry_run,
    };
    let mut cleaner = Cleaner::new(&mut state, disk, options);
    Ok(cleaner.clean_dead(&build_log))
}

fn tool_restat(opts: &Opts, disk: &RealDisk) -> anyhow::Result<i32> {
    let loaded = load::read(disk, &opts.build_file)?;
    let (build_log_path, _) = log_paths(disk, &loaded.builddir)?;
    let mut build_log = BuildLog::new();
    build_log.load(&build_log_path)?;
    build_log.restat(&build_log_path, disk, &opts.targets)?;
    Ok(0)
}

fn run_impl() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();

    let mut explain = false;
    if let Some(debug) = &opts.debug {
        match debug.as_str() {
            "list" => {
                println!("debugging tools:");
                println!("  trace    write a chrome trace of the build to trace.json");
                println!("  explain  print why each command runs");
                return Ok(1);
            }
            "trace" => trace::open("trace.json")?,
            "explain" => explain = true,
            _ => bail!("unknown -d {:?}, use -d list to list", debug),
        }
    }

    if let Some(dir) = &opts.chdir {
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    let disk = RealDisk::new();

    if let Some(tool) = &opts.tool {
        if tool == "list" {
            println!("subtools:");
            for tool in TOOLS {
                println!("  {:10} {}", tool.name, tool.desc);
            }
            return Ok(1);
        }
        match TOOLS.iter().find(|t| t.name == tool) {
            Some(tool) => return (tool.func)(&opts, &disk),
            None => bail!("unknown -t {:?}, use -t list to list", tool),
        }
    }

    signal::register_sigint();

    let parallelism = match opts.parallelism {
        Some(parallelism) => parallelism,
        None => default_parallelism()?,
    };
    let params = BuildParams {
        options: work::Options {
            parallelism,
            failures_allowed: opts.keep_going,
            max_load_average: opts.load_average,
            explain,
        },
        target_names: &opts.targets,
        build_filename: &opts.build_file,
    };

    let verbosity = if opts.quiet {
        Verbosity::Quiet
    } else if opts.verbose {
        Verbosity::Verbose
    } else {
        Verbosity::Normal
    };
    let mut status = StatusPrinter::new(verbosity, parallelism);

    match build(&mut status, &disk, &params) {
        Ok(None) => {
            // The failing task's output is enough information.
            Ok(1)
        }
        Ok(Some(0)) => {
            println!("joist: no work to do");
            Ok(0)
        }
        Ok(Some(n)) => {
            println!(
                "joist: ran {} task{}, now up to date",
                n,
                if n == 1 { "" } else { "s" }
            );
            Ok(0)
        }
        Err(err) if err.downcast_ref::<Interrupted>().is_some() => {
            println!("joist: interrupted by user");
            Ok(2)
        }
        Err(err) => Err(err),
    }
}

pub fn run() -> anyhow::Result<i32> {
    let res = run_impl();
    let _ = trace::close();
    res
}
