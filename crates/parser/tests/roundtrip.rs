use dir_test::{dir_test, Fixture};
use ir::ModuleWriter;
use memspace_parser::parse_module;

#[dir_test(
    dir: "$CARGO_MANIFEST_DIR/test_files/roundtrip",
    glob: "*.mir"
)]
fn test_roundtrip(fixture: Fixture<&str>) {
    let module = match parse_module(fixture.content()) {
        Ok(module) => module,
        Err(errs) => {
            for err in errs {
                eprintln!("{}", err.print_to_string(fixture.path(), fixture.content(), false));
            }
            panic!("failed to parse {}", fixture.path());
        }
    };
    let written = ModuleWriter::new(&module).dump_string().unwrap();
    assert_eq!(written, *fixture.content());
}

#[test]
fn parsed_module_structure() {
    let src = "\
module @m;

comp %body {
    p: f32[4]{S(1)} = parameter(), number=0;
    n: f32[4] = negate(p);
    root n;
}

comp %cond {
    p: f32[4] = parameter(), number=0;
    c: pred[] = constant();
    root c;
}

entry comp %main {
    a: f32[4] = parameter(), number=0;
    w: f32[4] = while(a), condition=%cond, body=%body;
    root w;
}
";
    let module = parse_module(src).unwrap();
    let main = module.entry().unwrap();
    assert_eq!(module.comps[main].name, "main");

    let w = module.comps[main].inst_by_name("w").unwrap();
    let data = module.inst(w);
    assert_eq!(data.opcode, ir::Opcode::While);
    let cond = data.while_condition().unwrap();
    let body = data.while_body().unwrap();
    assert_eq!(module.comps[cond].name, "cond");
    assert_eq!(module.comps[body].name, "body");

    let p = module.comps[body].params()[0];
    assert_eq!(module.shape(p).as_array().unwrap().memory_space, 1);

    // Callees are written before callers regardless of definition order.
    insta::assert_snapshot!(ModuleWriter::new(&module).dump_string().unwrap(), @r"
    module @m;

    comp %body {
        p: f32[4]{S(1)} = parameter(), number=0;
        n: f32[4] = negate(p);
        root n;
    }

    comp %cond {
        p: f32[4] = parameter(), number=0;
        c: pred[] = constant();
        root c;
    }

    entry comp %main {
        a: f32[4] = parameter(), number=0;
        w: f32[4] = while(a), condition=%cond, body=%body;
        root w;
    }
    ");
}
