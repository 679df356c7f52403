use std::path::Path;

use dir_test::{dir_test, Fixture};
use memspace_parser::parse_module;

/// Each fixture starts with `// error: <message>` naming one of the errors
/// the parser must report.
#[dir_test(
    dir: "$CARGO_MANIFEST_DIR/test_files/errors",
    glob: "*.mir"
)]
fn test_errors(fixture: Fixture<&str>) {
    let expected = fixture
        .content()
        .lines()
        .next()
        .and_then(|l| l.strip_prefix("// error: "))
        .expect("fixture must start with an `// error:` line");

    let Err(errs) = parse_module(fixture.content()) else {
        panic!("expected parse_module to fail with errors");
    };
    let messages: Vec<_> = errs.iter().map(|e| e.message()).collect();
    assert!(
        messages.iter().any(|m| m == expected),
        "expected `{expected}`, got {messages:?}"
    );

    let path = Path::new(fixture.path())
        .file_name()
        .unwrap()
        .to_string_lossy();
    let rendered = errs[0].print_to_string(&path, fixture.content(), false);
    assert!(rendered.contains("parse error"));
    assert!(rendered.contains(path.as_ref()));
}

#[test]
fn syntax_error_is_reported() {
    let errs = parse_module("module @m;\nentry comp %main {\n    p f32[4];\n}\n").unwrap_err();
    assert_eq!(errs.len(), 1);
    assert!(matches!(errs[0], memspace_parser::Error::SyntaxError(_)));
}

#[test]
fn number_out_of_bounds() {
    let src = "module @m;\nentry comp %main {\n    p: f32[4] = parameter(), number=99999999999;\n    root p;\n}\n";
    let errs = parse_module(src).unwrap_err();
    assert!(errs
        .iter()
        .any(|e| matches!(e, memspace_parser::Error::NumberOutOfBounds(_))));
}
