pub mod config;
pub mod state;
pub mod syntax;

use self::config::Config;
use self::state::jobs::{Executor, ForkExec};
use self::state::{Flow, ShellState};
use std::io::{self, BufRead, Write};

/// Prefix for every diagnostic the shell prints.
pub const NAME: &str = "myshell";

pub struct Shell<E = ForkExec> {
    config: Config,
    state: ShellState<E>,
}

impl Shell<ForkExec> {
    pub fn new(config: Config) -> Self {
        Shell {
            config,
            state: ShellState::new(),
        }
    }
}

impl<E: Executor> Shell<E> {
    #[cfg(test)]
    pub fn with_executor(config: Config, executor: E) -> Self {
        Shell {
            config,
            state: ShellState::with_executor(executor),
        }
    }

    pub fn run_interactive(&mut self) -> i32 {
        let stdin = io::stdin();
        let show_prompt = self.config.interactive || termion::is_tty(&stdin);
        self.run(stdin.lock(), show_prompt)
    }

    /// Reads and runs lines until end of input or `exit`. Returns the shell's
    /// exit status.
    pub fn run<R: BufRead>(&mut self, mut input: R, show_prompt: bool) -> i32 {
        let mut buffer = Vec::new();
        loop {
            if show_prompt {
                let mut stdout = io::stdout();
                if let Err(e) = write!(stdout, "{}", self.config.prompt).and_then(|_| stdout.flush()) {
                    warn!("failed to write prompt: {}", e);
                }
            }

            buffer.clear();
            match input.read_until(b'\n', &mut buffer) {
                Ok(0) => return 0,
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    eprintln!("{}: input error: {}", NAME, e);
                    return 1;
                }
            }

            let line = strip_line_ending(&buffer);
            if line.len() > self.config.max_line {
                eprintln!("{}: input line too long", NAME);
                continue;
            }
            let tokens = syntax::lexer::tokenize(line);
            trace!("tokens: {:?}", tokens);

            match self.state.run(&tokens) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(status)) => return status,
                Err(e) => eprintln!("{}: {}", NAME, e),
            }
        }
    }
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
