pub mod build_log;
pub mod canon;
pub mod clean;
mod densemap;
pub mod depfile;
pub mod deps_log;
pub mod disk;
pub mod dyndep;
pub mod eval;
pub mod graph;
pub mod hash;
pub mod load;
pub mod parse;
pub mod plan;
pub mod run;
pub mod scan;
mod scanner;
mod signal;
mod smallmap;
pub mod status;
mod task;
mod terminal;
pub mod trace;
pub mod work;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
