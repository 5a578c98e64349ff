use crate::e2e::*;

/// A dyndep file that exists up front extends its edge's inputs at scan
/// time.
#[test]
fn static_dyndep_extends_inputs() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule r
  command = cat $in > $out
  dyndep = dd
build out: r in || dd
",
    )?;
    space.write("in", "x\n")?;
    space.write("extra", "e1\n")?;
    space.write("dd", "ninja_dyndep_version = 1\nbuild out: dyndep | extra\n")?;

    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 1 task");

    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "no work");

    // The dyndep-discovered input participates in dirtiness.
    space.touch("extra", "e2\n")?;
    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 1 task");
    Ok(())
}

/// A dyndep file that is itself built mid-build gets loaded once its edge
/// finishes, before its consumer is scheduled.
#[cfg(unix)]
#[test]
fn generated_dyndep_loads_mid_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule gen_dd
  command = printf 'ninja_dyndep_version = 1\\nbuild out: dyndep | extra\\n' > $out
rule r
  command = cat $in > $out
  dyndep = dd
build dd: gen_dd dd-src
build out: r in || dd
",
    )?;
    space.write("dd-src", "s\n")?;
    space.write("in", "x\n")?;
    space.write("extra", "e\n")?;

    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 2 tasks");
    assert_eq!(space.read("out")?, b"x\n");
    Ok(())
}
