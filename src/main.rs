//! CLI driver: run a `.cmel` file or start a line REPL, mapping
//! `InterpretResult` onto the documented process exit codes. A thin shell
//! around `Vm::interpret` — all real behavior lives in the library crate.

use std::io::Write;
use std::process::ExitCode;

use cmel::vm::{InterpretResult, Vm};

const EXIT_OK: u8 = 0;
const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let code = match args.as_slice() {
        [_] => run_repl(),
        [_, path] => run_file(path),
        [program, ..] => {
            eprintln!("Usage: {} [path]", program);
            64
        }
    };
    ExitCode::from(code)
}

fn run_file(path: &str) -> u8 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not open file \"{path}\": {err}");
            return EXIT_RUNTIME_ERROR;
        }
    };
    let mut vm = Vm::new();
    match vm.interpret(&source) {
        InterpretResult::Ok => EXIT_OK,
        InterpretResult::CompileError => EXIT_COMPILE_ERROR,
        InterpretResult::RuntimeError => EXIT_RUNTIME_ERROR,
    }
}

/// A line-at-a-time REPL: each line runs in the same `Vm`, so globals and
/// classes defined on one line stay visible on the next. A failed line never
/// exits the process — that's reserved for EOF (Ctrl-D) or an explicit
/// `exit()`-style script.
fn run_repl() -> u8 {
    let mut vm = Vm::new();
    let mut line = String::new();
    loop {
        print!("> ");
        if std::io::stdout().flush().is_err() {
            return EXIT_OK;
        }
        line.clear();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) => {
                println!();
                return EXIT_OK;
            }
            Ok(_) => {
                vm.interpret(&line);
            }
            Err(err) => {
                eprintln!("Error reading line: {err}");
                return EXIT_RUNTIME_ERROR;
            }
        }
    }
}
