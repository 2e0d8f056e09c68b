//! XVM assembler CLI.
//!
//! Compiles an assembly source file into an object image.
//!
//! # Usage
//! ```text
//! xasm -i <input.asm> -o <output.xvm> [-d]
//! xasm <input.asm> [-o <output.xvm>] [-d]
//! ```
//!
//! The output file is only written when assembly succeeds. Any error exits with status 1.

use std::env;
use std::fs;
use std::path::Path;
use std::process;
use xvm::virtual_machine::assembler::{AsmOptions, assemble, render_diagnostic};
use xvm::{error, info};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let mut input_path: Option<String> = None;
    let mut output_path: Option<String> = None;
    let mut options = AsmOptions::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--input" | "-i") => {
                input_path = Some(flag_value(&args, &mut i, k));
            }
            k @ ("--output" | "-o") => {
                output_path = Some(flag_value(&args, &mut i, k));
            }
            "--debug" | "-d" => {
                options.debug = true;
                i += 1;
            }
            other if !other.starts_with('-') && input_path.is_none() => {
                input_path = Some(other.to_string());
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let Some(input_path) = input_path else {
        error!("no input file given\n");
        print_usage(&args[0]);
        process::exit(1);
    };

    let output_path = output_path.unwrap_or_else(|| {
        Path::new(&input_path)
            .with_extension("xvm")
            .to_string_lossy()
            .into_owned()
    });

    let source = fs::read_to_string(&input_path).unwrap_or_else(|e| {
        error!("Failed to read {}: {}", input_path, e);
        process::exit(1);
    });

    let image = match assemble(&source, &options) {
        Ok(image) => image,
        Err(e) => {
            error!("Assembly failed:\n{}", render_diagnostic(&input_path, &source, &e));
            process::exit(1);
        }
    };

    let bytes = image.to_bytes();
    if let Err(e) = fs::write(&output_path, &bytes) {
        error!("Failed to write {}: {}", output_path, e);
        process::exit(1);
    }

    info!(
        "Compiled {} -> {} ({} bytes{})",
        input_path,
        output_path,
        bytes.len(),
        if options.debug { ", with symbols" } else { "" }
    );
}

/// Returns the value following `flag` at `args[*i]` and advances past both.
fn flag_value(args: &[String], i: &mut usize, flag: &str) -> String {
    *i += 1;
    if *i >= args.len() {
        error!("{flag} requires an argument");
        process::exit(1);
    }
    *i += 1;
    args[*i - 1].clone()
}

const USAGE: &str = "\
XVM Assembler

USAGE:
    {program} -i <input.asm> -o <output.xvm> [-d]
    {program} <input.asm> [-o <output.xvm>] [-d]

OPTIONS:
    -i, --input <file>      Assembly source file
    -o, --output <file>     Output image path (defaults to <input>.xvm)
    -d, --debug             Emit the symbol table
    -h, --help              Print this help message
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
