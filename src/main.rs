//! Command-line front-end for the virtual machine.
//!
//! Loads a `.lvme` module, maps it into linear memory and runs it to
//! completion.
//!
//! # Usage
//! ```text
//! lvm <file> [OPTIONS]
//! ```
//!
//! The process exit code is the bytecode's EXIT status (low 8 bits), 0 when
//! the root thread simply finishes, or 1 on a load or runtime failure.

use lvm::module::Module;
use lvm::utils::log::{self, Level};
use lvm::vm::{VirtualMachine, DEFAULT_STACK_SIZE};
use lvm::{error, info};
use std::env;
use std::process;
use std::time::Instant;

const USAGE: &str = "\
lvm - register-based bytecode virtual machine

USAGE:
    {program} <file> [OPTIONS]

ARGS:
    <file>    Module file to execute

OPTIONS:
    --stack-size <bytes>    Stack size per thread (default 4194304)
    --log-level <level>     info | warn | error | off (default info)
    -h, --help              Print this help message
";

/// Prints usage information to stderr.
fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let file = &args[1];
    let mut stack_size = DEFAULT_STACK_SIZE;
    let mut level = Level::Info;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--stack-size" => {
                i += 1;
                let value = args.get(i).and_then(|v| v.parse::<u64>().ok());
                match value {
                    Some(v) if v > 0 => stack_size = v,
                    _ => {
                        eprintln!("--stack-size requires a positive integer");
                        process::exit(1);
                    }
                }
                i += 1;
            }
            "--log-level" => {
                i += 1;
                let value = args.get(i).and_then(|v| v.parse::<Level>().ok());
                match value {
                    Some(v) => level = v,
                    None => {
                        eprintln!("--log-level requires one of: info, warn, error, off");
                        process::exit(1);
                    }
                }
                i += 1;
            }
            other => {
                eprintln!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    log::init(level);

    let raw = match std::fs::read(file) {
        Ok(raw) => raw,
        Err(e) => {
            error!("failed to read {file}: {e}");
            process::exit(1);
        }
    };
    let module = match Module::from_bytes(&raw) {
        Ok(module) => module,
        Err(e) => {
            error!("failed to load {file}: {e}");
            process::exit(1);
        }
    };

    let vm = VirtualMachine::new(stack_size);

    let start = Instant::now();
    vm.init(&module);
    let init_time = start.elapsed();
    info!("Init time: {} ms", init_time.as_millis());

    let run_start = Instant::now();
    let status = match vm.run() {
        Ok(status) => status,
        Err(e) => {
            error!("runtime error: {e}");
            process::exit(1);
        }
    };
    let run_time = run_start.elapsed();
    info!("Execution time: {} ms", run_time.as_millis());
    info!("Total time: {} ms", (init_time + run_time).as_millis());

    process::exit((status & 0xFF) as i32);
}
