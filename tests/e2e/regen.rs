use crate::e2e::*;

const MANIFEST: &str = "rule regen
  command = cat spec > build.ninja
  generator = 1
rule touch
  command = touch $out
build build.ninja: regen spec
build out: touch
";

/// A manifest that is itself a build target is brought up to date (and
/// reloaded) before the requested targets build.
#[cfg(unix)]
#[test]
fn manifest_regenerates_before_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("spec", MANIFEST)?;
    space.write("build.ninja", MANIFEST)?;

    space.run_expect(&mut joist_command(vec!["out"]))?;
    assert!(space.read("out").is_ok());

    // Everything converged: the second invocation is quiet.
    let out = space.run_expect(&mut joist_command(vec!["out"]))?;
    assert_output_contains(&out, "no work");
    Ok(())
}

/// Editing the spec regenerates the manifest, and the new manifest's
/// contents are what the main build sees.
#[cfg(unix)]
#[test]
fn manifest_changes_are_picked_up() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("spec", MANIFEST)?;
    space.write("build.ninja", MANIFEST)?;
    space.run_expect(&mut joist_command(vec!["out"]))?;

    // The new spec adds another target.
    let extended = format!("{}build extra: touch\n", MANIFEST);
    space.touch("spec", &extended)?;
    space.run_expect(&mut joist_command(vec!["extra"]))?;
    assert!(space.read("extra").is_ok());
    assert_eq!(space.read("build.ninja")?, extended.as_bytes());
    Ok(())
}
