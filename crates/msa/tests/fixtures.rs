mod common;

use dir_test::{dir_test, Fixture};
use ir::ModuleWriter;
use memspace_msa::{run, Options, ShapeCostAnalysis};

#[dir_test(
    dir: "$CARGO_MANIFEST_DIR/test_files",
    glob: "*.mir"
)]
fn test_assignment(fixture: Fixture<&str>) {
    let mut module = common::parse(fixture.content());
    let options = Options::default();
    let output = match run(&mut module, &ShapeCostAnalysis::default(), &options) {
        Ok(output) => output,
        Err(err) => panic!("{}: {err}", fixture.path()),
    };
    assert!(!output.report.has_errors());
    assert!(output.trace.footprint() <= options.max_size_bytes);
    assert!(output.preset.size <= options.max_size_bytes);

    // The patched module is still valid input.
    let written = ModuleWriter::new(&module).dump_string().unwrap();
    let reparsed = common::parse(&written);
    assert_eq!(ModuleWriter::new(&reparsed).dump_string().unwrap(), written);
}
