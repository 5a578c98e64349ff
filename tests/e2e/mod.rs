//! Support code for e2e tests, which run joist as a binary.

mod basic;
mod clean;
mod discovered;
mod dyndep;
mod pools;
mod regen;
mod restat;
mod validations;

pub fn joist_binary() -> std::path::PathBuf {
    std::env::current_exe()
        .expect("test binary path")
        .parent()
        .expect("test binary directory")
        .parent()
        .expect("binary directory")
        .join("joist")
}

pub fn joist_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(joist_binary());
    cmd.args(args);
    cmd
}

fn print_output(out: &std::process::Output) {
    // Use print! so the Rust test framework can capture it.
    print!("{}", String::from_utf8_lossy(&out.stdout));
    print!("{}", String::from_utf8_lossy(&out.stderr));
}

pub fn assert_output_contains(out: &std::process::Output, text: &str) {
    let stdout = String::from_utf8_lossy(&out.stdout);
    let stderr = String::from_utf8_lossy(&out.stderr);
    if !stdout.contains(text) && !stderr.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?} but got:\n{}{}",
            text, stdout, stderr
        );
    }
}

#[allow(dead_code)]
pub fn assert_output_not_contains(out: &std::process::Output, text: &str) {
    let stdout = String::from_utf8_lossy(&out.stdout);
    if stdout.contains(text) {
        panic!(
            "assertion failed; expected output to not contain {:?} but got:\n{}",
            text, stdout
        );
    }
}

/// Manages a temporary directory for invoking joist.
pub struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    /// Write a file into the working space.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.path().join(path), content)
    }

    /// Read a file from the working space.
    pub fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    pub fn metadata(&self, path: &str) -> std::io::Result<std::fs::Metadata> {
        std::fs::metadata(self.dir.path().join(path))
    }

    /// Bump a file's mtime by rewriting it, after a pause coarse filesystem
    /// timestamps can see.
    pub fn touch(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::thread::sleep(std::time::Duration::from_millis(10));
        self.write(path, content)
    }

    /// Invoke joist, returning process output.
    pub fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    /// Like run, but also print output if the build failed.
    pub fn run_expect(
        &self,
        cmd: &mut std::process::Command,
    ) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            anyhow::bail!("build failed, status {}", out.status);
        }
        Ok(out)
    }
}

// Rules shared by many tests.

pub const TOUCH_RULE: &str = "
rule touch
  command = touch $out
  description = touch $out
";

pub const CAT_RULE: &str = "
rule cat
  command = cat $in > $out
  description = cat $out
";
