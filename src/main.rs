// File: src/main.rs
//
// Main entry point for the Cinder interpreter.
// Handles command-line argument parsing and dispatches to the appropriate
// subcommand (run or repl).

mod bytecode;
mod compiler;
mod errors;
mod lexer;
mod object;
mod repl;
mod table;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use colored::Colorize;
use errors::InterpretError;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

// Conventional sysexits codes: data error, internal error, I/O error.
const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;
const EXIT_IO_ERROR: u8 = 74;

#[derive(ClapParser)]
#[command(
    name = "cinder",
    about = "Cinder: a small class-based scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Run a Cinder script file
    Run {
        /// Path to the .cin file
        file: PathBuf,

        /// Dump the compiled bytecode before executing
        #[arg(long)]
        disassemble: bool,
    },

    /// Launch the interactive Cinder REPL
    Repl,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, disassemble } => {
            let source = match fs::read_to_string(&file) {
                Ok(source) => source,
                Err(error) => {
                    eprintln!(
                        "{} could not read {}: {}",
                        "error:".bright_red().bold(),
                        file.display(),
                        error
                    );
                    return ExitCode::from(EXIT_IO_ERROR);
                }
            };

            let mut vm = vm::Vm::new();
            vm.set_disassemble(disassemble);
            match vm.interpret(&source) {
                Ok(()) => ExitCode::SUCCESS,
                Err(InterpretError::Compile(error)) => {
                    eprintln!("{}", error);
                    ExitCode::from(EXIT_COMPILE_ERROR)
                }
                Err(InterpretError::Runtime(error)) => {
                    eprintln!("{}", error);
                    ExitCode::from(EXIT_RUNTIME_ERROR)
                }
            }
        }

        Commands::Repl => match repl::Repl::new() {
            Ok(mut repl) => {
                if let Err(error) = repl.run() {
                    eprintln!("{} {}", "REPL error:".bright_red(), error);
                    return ExitCode::FAILURE;
                }
                ExitCode::SUCCESS
            }
            Err(error) => {
                eprintln!("{} {}", "Failed to start REPL:".bright_red(), error);
                ExitCode::FAILURE
            }
        },
    }
}
