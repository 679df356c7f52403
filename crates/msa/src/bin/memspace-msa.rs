use std::{env, fs, process};

use ir::ModuleWriter;
use memspace_msa::{options::PickerKind, Options, ShapeCostAnalysis};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let mut input_path = None;
    let mut options = Options::default();
    let mut show_trace = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--capacity" => options.max_size_bytes = number(&arg, args.next()),
            "--max-prefetches" => options.max_outstanding_prefetches = number(&arg, args.next()),
            "--max-evictions" => options.max_outstanding_evictions = number(&arg, args.next()),
            "--picker" => {
                let Some(value) = args.next() else {
                    eprintln!("error: --picker requires one of: count, cost");
                    process::exit(2);
                };
                options.picker = match value.as_str() {
                    "count" => PickerKind::InstructionCount,
                    "cost" => PickerKind::CostAnalysis,
                    _ => {
                        eprintln!("error: unknown picker `{value}`");
                        process::exit(2);
                    }
                };
            }
            "--fifo" => options.enforce_prefetch_fifo_order = true,
            "--trace" => show_trace = true,
            "--help" | "-h" => {
                print_help();
                return;
            }
            other if other.starts_with('-') => {
                eprintln!("error: unknown flag `{other}`");
                process::exit(2);
            }
            path => {
                if input_path.replace(path.to_string()).is_some() {
                    eprintln!("error: expected exactly one input file path");
                    process::exit(2);
                }
            }
        }
    }

    let Some(path) = input_path else {
        print_help();
        process::exit(2);
    };

    let source = match fs::read_to_string(&path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: failed to read `{path}`: {err}");
            process::exit(2);
        }
    };

    let mut module = match parser::parse_module(&source) {
        Ok(module) => module,
        Err(errors) => {
            for error in errors {
                eprintln!("{}", error.print_to_string(&path, &source, false));
            }
            process::exit(1);
        }
    };

    let output = match memspace_msa::run(&mut module, &ShapeCostAnalysis::default(), &options) {
        Ok(output) => output,
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(1);
        }
    };

    match ModuleWriter::new(&module).dump_string() {
        Ok(text) => print!("{text}"),
        Err(err) => {
            eprintln!("error: failed to print module: {err}");
            process::exit(1);
        }
    }
    println!();
    println!("{}", output.stats);
    if show_trace {
        println!();
        println!("{}", output.trace);
    }
}

fn number<T: std::str::FromStr>(flag: &str, value: Option<String>) -> T {
    match value.as_deref().map(str::parse) {
        Some(Ok(n)) => n,
        _ => {
            eprintln!("error: {flag} requires a number");
            process::exit(2);
        }
    }
}

fn print_help() {
    println!(
        "Usage: memspace-msa <file.mir> [--capacity N] [--picker count|cost]\n\
         \x20                   [--max-prefetches N] [--max-evictions N] [--fifo] [--trace]\n\
         Assigns values to alternate memory and prints the patched module."
    );
}
