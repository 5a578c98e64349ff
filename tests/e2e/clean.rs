use crate::e2e::*;

fn build_two_step(space: &TestSpace) -> anyhow::Result<()> {
    space.write(
        "build.ninja",
        &[CAT_RULE, "build mid: cat in", "build out: cat mid", ""].join("\n"),
    )?;
    space.write("in", "x\n")?;
    space.run_expect(&mut joist_command(vec!["out"]))?;
    Ok(())
}

#[test]
fn clean_all_removes_outputs() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    build_two_step(&space)?;

    let out = space.run_expect(&mut joist_command(vec!["-t", "clean"]))?;
    assert_output_contains(&out, "2 files.");
    assert!(space.read("in").is_ok());
    assert!(space.read("mid").is_err());
    assert!(space.read("out").is_err());
    Ok(())
}

#[test]
fn clean_dry_run_keeps_files() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    build_two_step(&space)?;

    let out = space.run_expect(&mut joist_command(vec!["-t", "clean", "-n"]))?;
    assert_output_contains(&out, "2 files.");
    assert!(space.read("mid").is_ok());
    assert!(space.read("out").is_ok());
    Ok(())
}

#[test]
fn clean_single_target_walks_its_chain() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            CAT_RULE,
            "build mid: cat in",
            "build out: cat mid",
            "build other: cat in",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "x\n")?;
    space.run_expect(&mut joist_command(vec!["out", "other"]))?;

    space.run_expect(&mut joist_command(vec!["-t", "clean", "mid"]))?;
    assert!(space.read("mid").is_err());
    assert!(space.read("out").is_ok());
    assert!(space.read("other").is_ok());
    Ok(())
}

#[test]
fn clean_rules_mode() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            CAT_RULE,
            TOUCH_RULE,
            "build copied: cat in",
            "build touched: touch",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "x\n")?;
    space.run_expect(&mut joist_command(vec!["copied", "touched"]))?;

    space.run_expect(&mut joist_command(vec!["-t", "clean", "-r", "cat"]))?;
    assert!(space.read("copied").is_err());
    assert!(space.read("touched").is_ok());
    Ok(())
}

#[test]
fn cleandead_removes_stale_log_outputs() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    build_two_step(&space)?;

    // Drop `out` from the manifest; its file and log entry remain.
    space.write(
        "build.ninja",
        &[CAT_RULE, "build mid: cat in", ""].join("\n"),
    )?;
    let out = space.run_expect(&mut joist_command(vec!["-t", "cleandead"]))?;
    assert_output_contains(&out, "1 files.");
    assert!(space.read("out").is_err());
    assert!(space.read("mid").is_ok());
    Ok(())
}

#[test]
fn restat_tool_rewrites_log_mtimes() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    build_two_step(&space)?;

    // Regenerate `mid` behind the build system's back, then restat: the log
    // learns the new mtime, so the next build only reruns the consumer.
    space.touch("mid", "x\n")?;
    space.run_expect(&mut joist_command(vec!["-t", "restat"]))?;
    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 1 task");
    Ok(())
}
