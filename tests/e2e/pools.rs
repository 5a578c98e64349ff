use crate::e2e::*;

/// Two slow tasks in a depth-1 pool must not overlap, even with spare
/// global parallelism.
#[cfg(unix)]
#[test]
fn pool_depth_one_serializes() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
pool serial
  depth = 1

rule trace
  command = echo begin-$out >> order && sleep 0.1 && echo end-$out >> order && touch $out
  pool = serial

build a: trace
build b: trace
build all: phony a b
",
    )?;
    space.run_expect(&mut joist_command(vec!["-j", "4", "all"]))?;

    let order = String::from_utf8(space.read("order")?)?;
    let lines: Vec<&str> = order.lines().collect();
    assert_eq!(lines.len(), 4);
    // Each task's begin/end pair is adjacent: no interleaving.
    assert_eq!(lines[0].replace("begin", "end"), lines[1]);
    assert_eq!(lines[2].replace("begin", "end"), lines[3]);
    Ok(())
}

/// An unconstrained pool lets both run at once; the interleaved trace shows
/// both begins before either end.
#[cfg(unix)]
#[test]
fn default_pool_overlaps() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule trace
  command = echo begin-$out >> order && sleep 0.3 && echo end-$out >> order && touch $out

build a: trace
build b: trace
build all: phony a b
",
    )?;
    space.run_expect(&mut joist_command(vec!["-j", "4", "all"]))?;

    let order = String::from_utf8(space.read("order")?)?;
    let lines: Vec<&str> = order.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("begin-"));
    assert!(
        lines[1].starts_with("begin-"),
        "expected overlapping tasks, got {:?}",
        lines
    );
    Ok(())
}
