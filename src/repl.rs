// File: src/repl.rs
//
// Interactive REPL for the Cinder language.
// Keeps a single VM alive across inputs so globals persist, buffers input
// until braces balance, and reports errors without exiting.

use crate::errors::InterpretError;
use crate::vm::Vm;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    fn show_banner(&self) {
        println!("{}", format!("Cinder {} interactive shell", env!("CARGO_PKG_VERSION")).bright_cyan());
        println!("  {} :quit to exit, unclosed braces continue on the next line", "Tip:".bright_magenta());
        println!();
    }

    /// Starts the REPL loop.
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "cinder> ".bright_green().to_string()
            } else {
                "......> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() {
                        match line.trim() {
                            ":quit" | ":q" | ":exit" => break,
                            ":help" | ":h" => {
                                self.show_help();
                                continue;
                            }
                            _ => {}
                        }
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (input cleared, :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "Goodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    fn show_help(&self) {
        println!("  {}   show this message", ":help".bright_yellow());
        println!("  {}   leave the shell", ":quit".bright_yellow());
    }

    fn eval_input(&mut self, source: &str) {
        match self.vm.interpret(source) {
            Ok(()) => {}
            Err(InterpretError::Compile(error)) => eprintln!("{}", error),
            Err(InterpretError::Runtime(error)) => eprintln!("{}", error),
        }
    }
}

/// A buffer is complete once every brace and paren opened outside a string
/// literal has been closed.
fn is_input_complete(source: &str) -> bool {
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => in_string = !in_string,
            '/' if !in_string && chars.peek() == Some(&'/') => {
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '{' | '(' if !in_string => depth += 1,
            '}' | ')' if !in_string => depth -= 1,
            _ => {}
        }
    }
    depth <= 0 && !in_string
}
