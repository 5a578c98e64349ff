use crate::e2e::*;

/// A fake compiler: copies its input and emits a depfile naming header.h.
const FAKE_CC: &str = "
rule cc
  command = cat $in > $out && echo \"$out: header.h\" > $out.d
  depfile = $out.d
  deps = gcc
";

#[cfg(unix)]
#[test]
fn discovered_header_triggers_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[FAKE_CC, "build main.o: cc main.c", ""].join("\n"),
    )?;
    space.write("main.c", "code\n")?;
    space.write("header.h", "h1\n")?;

    let out = space.run_expect(&mut joist_command(vec!["main.o"]))?;
    assert_output_contains(&out, "ran 1 task");

    // The depfile was folded into the deps log and removed.
    assert!(space.read("main.o.d").is_err());
    assert!(space.read(".ninja_deps").is_ok());

    let out = space.run_expect(&mut joist_command(vec!["main.o"]))?;
    assert_output_contains(&out, "no work");

    // Touching the discovered header dirties the object.
    space.touch("header.h", "h2\n")?;
    let out = space.run_expect(&mut joist_command(vec!["main.o"]))?;
    assert_output_contains(&out, "ran 1 task");
    Ok(())
}

#[cfg(unix)]
#[test]
fn depfile_without_deps_binding_is_read_at_scan_time() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cc
  command = cat $in > $out && echo \"$out: header.h\" > $out.d
  depfile = $out.d
build main.o: cc main.c
",
    )?;
    space.write("main.c", "code\n")?;
    space.write("header.h", "h1\n")?;

    space.run_expect(&mut joist_command(vec!["main.o"]))?;
    // Without `deps = gcc` the depfile stays on disk.
    assert!(space.read("main.o.d").is_ok());

    let out = space.run_expect(&mut joist_command(vec!["main.o"]))?;
    assert_output_contains(&out, "no work");

    space.touch("header.h", "h2\n")?;
    let out = space.run_expect(&mut joist_command(vec!["main.o"]))?;
    assert_output_contains(&out, "ran 1 task");
    Ok(())
}
