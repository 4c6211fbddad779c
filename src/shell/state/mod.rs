use super::syntax::parser;
use argh::{EarlyExit, FromArgs};
use nix::errno::Errno;
use std::env;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

pub mod jobs;
use self::jobs::{Executor, ForkExec, Job};

#[derive(FromArgs, Debug)]
/// Change the working directory.
struct Cd {
    /// directory to change to; defaults to $HOME
    #[argh(positional)]
    target: Option<String>,
}

#[derive(FromArgs, Debug)]
/// Leave the shell.
struct Exit {
    /// exit status of the shell; defaults to 0
    #[argh(positional)]
    status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Cd,
    Exit,
}

impl Builtin {
    pub fn lookup(name: &OsStr) -> Option<Builtin> {
        match name.to_str()? {
            "cd" => Some(Builtin::Cd),
            "exit" => Some(Builtin::Exit),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Cd => "cd",
            Builtin::Exit => "exit",
        }
    }
}

/// What the read loop should do after a line has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit(i32),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Syntax(#[from] parser::Error),
    #[error(transparent)]
    Job(#[from] jobs::Error),
    #[error("cd: {}: {}", .path.display(), .errno.desc())]
    ChangeDirectory { path: PathBuf, errno: Errno },
    #[error("cd: HOME not set")]
    NoHome,
    #[error("exit: {0}: numeric argument required")]
    ExitStatus(String),
    #[error("{name}: {message}")]
    Usage { name: &'static str, message: String },
}

pub struct ShellState<E = ForkExec> {
    executor: E,
}

impl ShellState<ForkExec> {
    pub fn new() -> Self {
        ShellState::with_executor(ForkExec)
    }
}

impl<E: Executor> ShellState<E> {
    pub fn with_executor(executor: E) -> Self {
        ShellState { executor }
    }

    #[cfg(test)]
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Handles one tokenized line. Built-ins are caught on the first token and
    /// never reach the executor.
    pub fn run(&mut self, tokens: &[OsString]) -> Result<Flow, Error> {
        let first = match tokens.first() {
            Some(first) => first,
            None => return Ok(Flow::Continue),
        };
        if let Some(builtin) = Builtin::lookup(first) {
            return self.handle_builtin(builtin, &tokens[1..]);
        }

        let expr = parser::parse(tokens)?;
        trace!("parsed: {:?}", expr);
        let job = Job::from_expr(&expr)?;
        let status = self.executor.execute(&job)?;
        if !status.success() {
            debug!("{} failed with status {}", job.name(), status.code());
        }
        Ok(Flow::Continue)
    }

    pub fn handle_builtin(&mut self, builtin: Builtin, raw: &[OsString]) -> Result<Flow, Error> {
        debug!("builtin {} {:?}", builtin.name(), raw);
        // argh only takes text; paths are taken from `raw` afterwards
        let lossy: Vec<String> = raw
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        let args: Vec<&str> = lossy.iter().map(String::as_str).collect();
        match builtin {
            Builtin::Cd => {
                let cd = match parse_builtin::<Cd>(builtin, &args)? {
                    Some(cd) => cd,
                    None => return Ok(Flow::Continue),
                };
                // `cd` has a single positional and no options, so a parsed
                // target is always the last argument
                let path = match (cd.target, raw.last()) {
                    (Some(_), Some(target)) => PathBuf::from(target),
                    _ => env::var_os("HOME").map(PathBuf::from).ok_or(Error::NoHome)?,
                };
                nix::unistd::chdir(&path).map_err(|errno| Error::ChangeDirectory { path, errno })?;
                Ok(Flow::Continue)
            }
            Builtin::Exit => {
                let exit = match parse_builtin::<Exit>(builtin, &args)? {
                    Some(exit) => exit,
                    None => return Ok(Flow::Continue),
                };
                match exit.status {
                    Some(status) => status
                        .parse::<i32>()
                        .map(Flow::Exit)
                        .map_err(|_| Error::ExitStatus(status)),
                    None => Ok(Flow::Exit(0)),
                }
            }
        }
    }
}

/// `Ok(None)` when argh handled the invocation itself, as for `--help`.
fn parse_builtin<T: FromArgs>(builtin: Builtin, args: &[&str]) -> Result<Option<T>, Error> {
    match T::from_args(&[builtin.name()], args) {
        Ok(parsed) => Ok(Some(parsed)),
        Err(EarlyExit {
            output,
            status: Ok(()),
        }) => {
            print!("{}", output);
            Ok(None)
        }
        Err(EarlyExit { output, .. }) => Err(Error::Usage {
            name: builtin.name(),
            message: output.trim().to_owned(),
        }),
    }
}
