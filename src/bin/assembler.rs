//! Assembly to bytecode compiler CLI.
//!
//! Reads assembly source files, compiles them to serialized scripts and can
//! disassemble or run the result.
//!
//! # Usage
//! ```text
//! assembler <input.asm|input.bin> [OPTIONS]
//! ```
//!
//! # Arguments
//! - `input.asm`: Assembly source file to compile
//! - `input.bin`: Previously compiled script (nothing is written)
//!
//! # Options
//! - `-o, --output <file>`: Output file path (defaults to `<input>.bin`)
//! - `-d, --disasm`: Print a bytecode listing
//! - `-r, --run`: Execute the script with the builtin extcalls
//! - `-g, --gas <limit>`: Gas limit for `--run`
//! - `-p, --price <price>`: Gas price for `--run` (defaults to 1)
//! - `--read-only`: Run with mutating extcalls disabled
//! - `-v, --verbose`: Enable debug logging
//!
//! # Examples
//! ```text
//! assembler program.asm
//! assembler program.asm -o output.bin -d
//! assembler program.asm -r -g 5000
//! assembler output.bin -r --read-only
//! ```

use blockchain_vm::utils::log::{Level, set_min_level};
use blockchain_vm::virtual_machine::assembler::assemble_file;
use blockchain_vm::virtual_machine::config::RunParams;
use blockchain_vm::virtual_machine::disassembler::listing;
use blockchain_vm::virtual_machine::extcall::ExtcallRegistry;
use blockchain_vm::virtual_machine::script::Script;
use blockchain_vm::virtual_machine::vm::VM;
use blockchain_vm::virtual_machine::vm::context::{ContextRegistry, ExecContext};
use blockchain_vm::virtual_machine::vm::gas::GasProfile;
use blockchain_vm::{debug, error, info, warn};
use std::env;
use std::fs;
use std::path::Path;
use std::process;

struct Options {
    input_path: String,
    output_path: Option<String>,
    disasm: bool,
    run: bool,
    gas_limit: Option<u64>,
    gas_price: u64,
    read_only: bool,
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let options = parse_args(&args);

    if !Path::new(&options.input_path).exists() {
        error!("Input file does not exist: {}", options.input_path);
        process::exit(1);
    }

    let script = if options.input_path.ends_with(".bin") {
        load_compiled(&options.input_path)
    } else {
        compile(&options)
    };
    debug!("{} labels resolved", script.labels().len());

    if options.disasm {
        match listing(script.code()) {
            Ok(text) => print!("{text}"),
            Err(e) => {
                error!("Disassembly failed: {e}");
                process::exit(1);
            }
        }
    }

    if options.run {
        run(&script, &options);
    }
}

fn parse_args(args: &[String]) -> Options {
    let mut options = Options {
        input_path: args[1].clone(),
        output_path: None,
        disasm: false,
        run: false,
        gas_limit: None,
        gas_price: 1,
        read_only: false,
    };

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--output" | "-o") => {
                options.output_path = Some(flag_value(args, i, k).to_string());
                i += 1;
            }
            k @ ("--gas" | "-g") => {
                options.gas_limit = Some(parse_number(flag_value(args, i, k), "gas limit"));
                i += 1;
            }
            k @ ("--price" | "-p") => {
                options.gas_price = parse_number(flag_value(args, i, k), "gas price");
                if options.gas_price == 0 {
                    error!("Gas price must be greater than 0");
                    process::exit(1);
                }
                i += 1;
            }
            "--disasm" | "-d" => options.disasm = true,
            "--run" | "-r" => options.run = true,
            "--read-only" => options.read_only = true,
            "--verbose" | "-v" => set_min_level(Level::Debug),
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
        i += 1;
    }

    if (options.gas_limit.is_some() || options.read_only) && !options.run {
        warn!("--gas and --read-only only apply together with --run");
    }
    options
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value.as_str(),
        None => {
            error!("{flag} requires an argument");
            process::exit(1);
        }
    }
}

fn parse_number(text: &str, what: &str) -> u64 {
    text.parse::<u64>().unwrap_or_else(|_| {
        error!("Invalid {what}: '{text}' is not a valid number");
        process::exit(1);
    })
}

fn load_compiled(path: &str) -> Script {
    let bytes = fs::read(path).unwrap_or_else(|e| {
        error!("Failed to read {path}: {e}");
        process::exit(1);
    });
    Script::from_bytes(&bytes).unwrap_or_else(|e| {
        error!("Invalid script file {path}: {e}");
        process::exit(1);
    })
}

fn compile(options: &Options) -> Script {
    let input_path = &options.input_path;
    let output_path = options.output_path.clone().unwrap_or_else(|| {
        let p = Path::new(input_path);
        let stem = p.file_stem().unwrap_or_default().to_string_lossy();
        let parent = p.parent().unwrap_or(Path::new("."));
        parent
            .join(format!("{}.bin", stem))
            .to_string_lossy()
            .into_owned()
    });

    if let Some(parent) = Path::new(&output_path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        error!("Output directory does not exist: {}", parent.display());
        process::exit(1);
    }

    let script = match assemble_file(input_path) {
        Ok(s) => s,
        Err(e) => {
            error!("Assembly failed: {}", e);
            process::exit(1);
        }
    };

    let bytes = script.to_bytes();
    if let Err(e) = fs::write(&output_path, &bytes) {
        error!("Failed to write output file: {}", e);
        process::exit(1);
    }

    info!(
        "Compiled {} -> {} ({} bytes of code, {} bytes written)",
        input_path,
        output_path,
        script.len(),
        bytes.len()
    );
    script
}

fn run(script: &Script, options: &Options) {
    let mut params = RunParams::default();
    params.gas_price = options.gas_price;
    if let Some(limit) = options.gas_limit {
        params.gas_limit = limit;
    }
    params.read_only = options.read_only;

    let extcalls = ExtcallRegistry::with_builtins();
    let contexts = ContextRegistry::new();
    let ctx = ExecContext::new(&extcalls, &contexts);

    let mut vm = VM::new(script, params).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1)
    });

    let outcome = vm.run(&ctx);
    print_gas_profile(vm.gas_profile());

    match outcome {
        Ok(()) => {
            println!("Result stack ({} values):", vm.stack().len());
            for (depth, value) in vm.stack().iter().rev().enumerate() {
                println!("  [{depth}] {value}");
            }
            info!(
                "Halted after {} gas (fee {})",
                format_with_commas(vm.gas_used()),
                vm.fee()
            );
        }
        Err(e) => {
            error!("{}: {}", e.kind().as_str(), e);
            process::exit(2);
        }
    }
}

fn print_gas_profile(profile: &GasProfile) {
    let total_u = profile.total();
    let total = total_u as f64;

    let cat_w = 2 + profile
        .iter()
        .map(|(c, _)| c.as_str().chars().count())
        .max()
        .unwrap_or(0)
        .max("total".chars().count());

    let amt_w = profile
        .iter()
        .map(|(_, a)| format_with_commas(a).chars().count())
        .max()
        .unwrap_or(0)
        .max(format_with_commas(total_u).chars().count());

    let dash_w = cat_w + 1 + amt_w + 2 + "( 100.0%)".len();

    println!("Gas Profile:");
    println!("{}", "-".repeat(dash_w));

    for (category, amount) in profile.iter() {
        if amount == 0 {
            continue;
        }

        let percent = if total > 0.0 {
            (amount as f64 / total) * 100.0
        } else {
            0.0
        };

        println!(
            "{:<cat_w$} {:>amt_w$} ({:>5.1}%)",
            category.as_str(),
            format_with_commas(amount),
            percent,
        );
    }

    println!("{}", "-".repeat(dash_w));
    println!(
        "{:<cat_w$} {:>amt_w$} ({:>5.1}%)",
        "total",
        format_with_commas(total_u),
        100.0,
    );
}

fn format_with_commas(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i).is_multiple_of(3) {
            result.push(',');
        }
        result.push(c);
    }
    result
}

const USAGE: &str = "\
Script Assembler

USAGE:
    {program} <input.asm|input.bin> [OPTIONS]

ARGS:
    <input.asm>    Assembly source file to compile
    <input.bin>    Compiled script to inspect or run

OPTIONS:
    -o, --output <file>     Output file path (defaults to <input>.bin)
    -d, --disasm            Print a bytecode listing
    -r, --run               Execute the script with the builtin extcalls
    -g, --gas <limit>       Gas limit for --run
    -p, --price <price>     Gas price for --run (defaults to 1)
        --read-only         Run with mutating extcalls disabled
    -v, --verbose           Enable debug logging
    -h, --help              Print this help message

EXAMPLES:
    # Compile to default output name
    {program} program.asm

    # Compile, list and run with a gas limit
    {program} program.asm -d -r -g 5000

    # Run a compiled script without side effects
    {program} program.bin -r --read-only
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
