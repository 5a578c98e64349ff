use crate::e2e::*;

/// A rule that only rewrites its output when the content would change, so
/// its output's mtime doesn't advance on a no-op run.
const COPY_IF_CHANGED: &str = "
rule maybe_copy
  command = if ! cmp -s $in $out; then cp $in $out; fi
  restat = 1
";

#[cfg(unix)]
#[test]
fn unchanged_output_suppresses_downstream() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            COPY_IF_CHANGED,
            CAT_RULE,
            "build mid: maybe_copy in",
            "build final: cat mid",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "same\n")?;

    let out = space.run_expect(&mut joist_command(vec!["final"]))?;
    assert_output_contains(&out, "ran 2 tasks");

    // Touch the input without changing its content.  The restat rule runs,
    // sees `mid` unchanged, and `final` is pruned from the plan.
    space.touch("in", "same\n")?;
    let out = space.run_expect(&mut joist_command(vec!["final"]))?;
    assert_output_contains(&out, "ran 1 task");

    // The build log recorded the newest input's mtime, so a third run has
    // nothing at all to do.
    let out = space.run_expect(&mut joist_command(vec!["final"]))?;
    assert_output_contains(&out, "no work");

    // An actual content change still flows through.
    space.touch("in", "different\n")?;
    let out = space.run_expect(&mut joist_command(vec!["final"]))?;
    assert_output_contains(&out, "ran 2 tasks");
    assert_eq!(space.read("final")?, b"different\n");
    Ok(())
}
