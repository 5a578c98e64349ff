use crate::e2e::*;

#[test]
fn empty_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", "")?;
    let out = space.run(&mut joist_command(vec![]))?;
    assert_eq!(
        String::from_utf8_lossy(&out.stdout),
        "joist: no work to do\n"
    );
    Ok(())
}

#[test]
fn basic_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut joist_command(vec!["out"]))?;
    assert!(space.read("out").is_ok());
    Ok(())
}

#[test]
fn create_subdir() -> anyhow::Result<()> {
    // A build rule whose output needs its directory created first.
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build subdir/out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut joist_command(vec!["subdir/out"]))?;
    assert!(space.read("subdir/out").is_ok());
    Ok(())
}

#[test]
fn second_build_is_no_work() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[CAT_RULE, "build out: cat in", ""].join("\n"),
    )?;
    space.write("in", "contents\n")?;

    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 1 task");
    assert_eq!(space.read("out")?, b"contents\n");

    // The output is newer than the input now.
    let in_mtime = space.metadata("in")?.modified()?;
    let out_mtime = space.metadata("out")?.modified()?;
    assert!(out_mtime >= in_mtime);

    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "no work");
    Ok(())
}

#[test]
fn two_step_chain() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[CAT_RULE, "build mid: cat in", "build out: cat mid", ""].join("\n"),
    )?;
    space.write("in", "one\n")?;

    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 2 tasks");

    // Nothing changed: no work.
    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "no work");

    // Touching the input rebuilds both edges.
    space.touch("in", "two\n")?;
    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 2 tasks");
    assert_eq!(space.read("out")?, b"two\n");
    Ok(())
}

#[test]
fn default_targets() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build a: touch",
            "build b: touch",
            "default a",
            "",
        ]
        .join("\n"),
    )?;
    space.run_expect(&mut joist_command(vec![]))?;
    assert!(space.read("a").is_ok());
    assert!(space.read("b").is_err());
    Ok(())
}

#[test]
fn phony_aggregates() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build a: touch",
            "build b: touch",
            "build all: phony a b",
            "",
        ]
        .join("\n"),
    )?;
    space.run_expect(&mut joist_command(vec!["all"]))?;
    assert!(space.read("a").is_ok());
    assert!(space.read("b").is_ok());
    Ok(())
}

#[test]
fn failing_command_sets_exit_code() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "rule fail\n  command = echo oh no && exit 1\nbuild out: fail in\n",
    )?;
    space.write("in", "")?;
    let out = space.run(&mut joist_command(vec!["out"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "oh no");
    Ok(())
}

#[test]
fn unknown_target_suggests() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    let out = space.run(&mut joist_command(vec!["oot"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "did you mean 'out'?");
    Ok(())
}

#[test]
fn missing_source_reports_chain() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[CAT_RULE, "build out: cat absent", ""].join("\n"),
    )?;
    let out = space.run(&mut joist_command(vec!["out"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "missing and no known rule to make it");
    Ok(())
}

#[test]
fn command_change_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "rule emit\n  command = echo one > $out\nbuild out: emit\n",
    )?;
    space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_eq!(space.read("out")?, b"one\n");

    space.write(
        "build.ninja",
        "rule emit\n  command = echo two > $out\nbuild out: emit\n",
    )?;
    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 1 task");
    assert_eq!(space.read("out")?, b"two\n");
    Ok(())
}

#[test]
fn order_only_inputs_do_not_retrigger() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            CAT_RULE,
            "build gen: cat gen-src",
            "build out: cat in || gen",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "x\n")?;
    space.write("gen-src", "g\n")?;

    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 2 tasks");

    // Touching only the order-only dependency rebuilds it, but not `out`.
    space.touch("gen-src", "g2\n")?;
    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 1 task");
    assert_eq!(space.read("out")?, b"x\n");
    Ok(())
}

#[test]
fn cycle_is_reported() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[CAT_RULE, "build a: cat b", "build b: cat a", ""].join("\n"),
    )?;
    let out = space.run(&mut joist_command(vec!["a"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "dependency cycle: a -> b -> a");
    Ok(())
}

#[test]
fn console_pool_runs() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "rule note\n  command = echo hello from console && touch $out\n  pool = console\nbuild out: note\n",
    )?;
    space.run_expect(&mut joist_command(vec!["out"]))?;
    assert!(space.read("out").is_ok());
    Ok(())
}

#[test]
fn builddir_holds_logs() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            "builddir = build-state",
            TOUCH_RULE,
            "build out: touch in",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut joist_command(vec!["out"]))?;
    assert!(space.read("build-state/.ninja_log").is_ok());
    Ok(())
}
