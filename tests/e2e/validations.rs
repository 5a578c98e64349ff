use crate::e2e::*;

/// Validation inputs (`|@`) are built alongside the target without gating
/// it.
#[test]
fn validations_build_alongside() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            CAT_RULE,
            "build out: cat in |@ check",
            "build check: cat check-src",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "x\n")?;
    space.write("check-src", "ok\n")?;

    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 2 tasks");
    assert!(space.read("out").is_ok());
    assert!(space.read("check").is_ok());
    Ok(())
}

/// A failing validation fails the build, even though the main output was
/// produced.
#[test]
fn failing_validation_fails_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            CAT_RULE,
            "rule fail",
            "  command = exit 1",
            "build out: cat in |@ check",
            "build check: fail check-src",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "x\n")?;
    space.write("check-src", "y\n")?;

    let out = space.run(&mut joist_command(vec!["out"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert!(space.read("out").is_ok());
    Ok(())
}
