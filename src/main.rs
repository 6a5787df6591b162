use clap::Parser;
use rustyline::DefaultEditor;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use kona::{InterpretError, RuntimeConfig, VM};

// BSD sysexits-style codes; part of the command-line contract.
const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

#[derive(Parser)]
#[command(name = "kona")]
#[command(about = "A small class-based scripting language", long_about = None)]
struct Cli {
    /// Source file to run; starts the interactive prompt when omitted
    file: Option<PathBuf>,

    /// Trace each instruction and the stack while executing
    #[arg(long)]
    trace: bool,

    /// Disassemble each function after compilation
    #[arg(long)]
    print_code: bool,

    /// Run the garbage collector on every dispatch step
    #[arg(long)]
    stress_gc: bool,

    /// Log garbage collection events to stderr
    #[arg(long)]
    log_gc: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EX_USAGE,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let config = RuntimeConfig {
        trace_execution: cli.trace,
        print_code: cli.print_code,
        stress_gc: cli.stress_gc,
        log_gc: cli.log_gc,
    };

    match cli.file {
        Some(path) => run_file(&path, config),
        None => repl(config),
    }
}

fn run_file(path: &Path, config: RuntimeConfig) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("error: could not read file '{}': {}", path.display(), e);
            return ExitCode::from(EX_IOERR);
        }
    };

    let mut vm = VM::new_with_config(config, Box::new(std::io::stdout()));
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ InterpretError::Compile(_)) => {
            eprintln!("{}", e);
            ExitCode::from(EX_DATAERR)
        }
        Err(e @ InterpretError::Runtime(_)) => {
            eprintln!("{}", e);
            ExitCode::from(EX_SOFTWARE)
        }
    }
}

fn repl(config: RuntimeConfig) -> ExitCode {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("error: could not start the prompt: {}", e);
            return ExitCode::from(EX_IOERR);
        }
    };

    // One VM for the whole session, so definitions carry across lines.
    let mut vm = VM::new_with_config(config, Box::new(std::io::stdout()));
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                // An empty line ends the session.
                if line.is_empty() {
                    break;
                }
                let _ = editor.add_history_entry(&line);
                if let Err(e) = vm.interpret(&line) {
                    eprintln!("{}", e);
                }
            }
            // EOF or interrupt also ends the session.
            Err(_) => break,
        }
    }
    ExitCode::SUCCESS
}
