use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::libc::{self, c_char};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use std::ffi::{CStr, CString, OsStr, OsString};
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{OwnedFd, RawFd};
use std::{iter, ptr};

use super::super::syntax::ast::{Argument, Command};

pub const STDIN: RawFd = 0;
pub const STDOUT: RawFd = 1;
/// Status the child exits with when it cannot become the requested program.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FdOption {
    Overwrite(CString),
    Input(CString),
}

impl FdOption {
    pub fn path(&self) -> &CStr {
        match self {
            FdOption::Overwrite(path) | FdOption::Input(path) => path.as_c_str(),
        }
    }

    fn open(&self) -> nix::Result<RawFd> {
        match self {
            FdOption::Overwrite(path) => fcntl::open(
                path.as_c_str(),
                OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
                Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
            ),
            FdOption::Input(path) => fcntl::open(path.as_c_str(), OFlag::O_RDONLY, Mode::empty()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Exited(i32),
    Signaled(Signal),
}

impl Status {
    pub fn success(&self) -> bool {
        *self == Status::Exited(0)
    }

    /// Exit code in the shell convention: 128 + signal number for signaled children.
    pub fn code(&self) -> i32 {
        match *self {
            Status::Exited(code) => code,
            Status::Signaled(signal) => 128 + signal as i32,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fork: {}", .0.desc())]
    Fork(Errno),
    #[error("pipe: {}", .0.desc())]
    Pipe(Errno),
    #[error("{0:?}: argument contains a nul byte")]
    StringEncoding(OsString),
    #[error("command not found: {0}")]
    CommandNotFound(String),
    #[error("{name}: {}", .errno.desc())]
    Exec { name: String, errno: Errno },
    #[error("{}: {}", .path.to_string_lossy(), .errno.desc())]
    Open { path: CString, errno: Errno },
    #[error("dup2: {}", .0.desc())]
    Rebind(Errno),
    #[error("signal: {}", .0.desc())]
    Signal(Errno),
    #[error("wait: {}", .0.desc())]
    Wait(Errno),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Open = 1,
    Rebind = 2,
    Exec = 3,
    Signal = 4,
}

/// What a child writes to the error pipe before giving up: the stage that
/// failed, which fd option it was working on, and the errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Failure {
    stage: Stage,
    index: u32,
    errno: i32,
}

impl Failure {
    const SIZE: usize = 9;

    fn new(stage: Stage, index: usize, errno: Errno) -> Failure {
        Failure {
            stage,
            index: index as u32,
            errno: errno as i32,
        }
    }

    fn encode(&self) -> [u8; Failure::SIZE] {
        let mut record = [0u8; Failure::SIZE];
        record[0] = self.stage as u8;
        record[1..5].copy_from_slice(&self.index.to_ne_bytes());
        record[5..9].copy_from_slice(&self.errno.to_ne_bytes());
        record
    }

    fn decode(record: &[u8]) -> Option<Failure> {
        if record.len() != Failure::SIZE {
            return None;
        }
        let stage = match record[0] {
            1 => Stage::Open,
            2 => Stage::Rebind,
            3 => Stage::Exec,
            4 => Stage::Signal,
            _ => return None,
        };
        let mut index = [0u8; 4];
        let mut errno = [0u8; 4];
        index.copy_from_slice(&record[1..5]);
        errno.copy_from_slice(&record[5..9]);
        Some(Failure {
            stage,
            index: u32::from_ne_bytes(index),
            errno: i32::from_ne_bytes(errno),
        })
    }
}

/// A command ready to launch. Everything the child needs is converted here,
/// before the fork, so the child only opens, duplicates and execs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    binary: CString,
    args: Vec<CString>,
    fd_options: Vec<(RawFd, FdOption)>,
}

impl Job {
    pub fn from_expr(expr: &Command) -> Result<Job, Error> {
        let binary = to_cstring(expr.binary)?;
        let mut args = vec![binary.clone()];
        let mut fd_options = Vec::new();
        for arg in &expr.arguments {
            match *arg {
                Argument::Literal(s) => args.push(to_cstring(s)?),
                Argument::Redirect(path) => {
                    fd_options.push((STDOUT, FdOption::Overwrite(to_cstring(path)?)))
                }
                Argument::Input(path) => fd_options.push((STDIN, FdOption::Input(to_cstring(path)?))),
            }
        }
        Ok(Job {
            binary,
            args,
            fd_options,
        })
    }

    pub fn name(&self) -> String {
        self.binary.to_string_lossy().into_owned()
    }

    #[cfg(test)]
    pub fn args(&self) -> &[CString] {
        &self.args
    }

    #[cfg(test)]
    pub fn fd_options(&self) -> &[(RawFd, FdOption)] {
        &self.fd_options
    }

    /// Forks and execs the job. Returns once the child has either become the
    /// requested program or given up; in the latter case the child is reaped
    /// and its failure is returned.
    pub fn spawn(&self) -> Result<Child, Error> {
        // the child must not allocate, so argv is laid out here
        let argv: Vec<*const c_char> = self
            .args
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(iter::once(ptr::null()))
            .collect();
        let (reader, writer) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(Error::Pipe)?;
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(writer);
                let child = Child {
                    pid: child,
                    name: self.name(),
                };
                debug!("forked {} for {}", child.pid, child.name);
                match read_failure(reader) {
                    Ok(None) => Ok(child),
                    Ok(Some(failure)) => {
                        let status = child.wait()?;
                        debug!("child gave up at {:?}, status {:?}", failure.stage, status);
                        Err(self.describe(failure))
                    }
                    Err(e) => {
                        warn!("unreadable launch report from {}: {}", child.pid, e);
                        Ok(child)
                    }
                }
            }
            Ok(ForkResult::Child) => {
                drop(reader);
                let failure = self.exec(&argv);
                let _ = unistd::write(&writer, &failure.encode());
                unsafe { libc::_exit(EXIT_FAILURE) }
            }
            Err(errno) => Err(Error::Fork(errno)),
        }
    }

    /// Runs in the child. Rebinds descriptors in order, so a later option for
    /// the same descriptor replaces an earlier one; every opened file is still
    /// created or truncated and then closed. Only returns on failure.
    ///
    /// Only async-signal-safe calls are made here: the parent may have other
    /// threads, and any of them could hold the allocator lock at fork time.
    fn exec(&self, argv: &[*const c_char]) -> Failure {
        // the shell runs with SIGPIPE ignored, which exec would pass on
        if let Err(errno) = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) } {
            return Failure::new(Stage::Signal, 0, errno);
        }
        for (index, (target, option)) in self.fd_options.iter().enumerate() {
            let fd = match option.open() {
                Ok(fd) => fd,
                Err(errno) => return Failure::new(Stage::Open, index, errno),
            };
            if fd != *target {
                let rebound = unistd::dup2(fd, *target);
                let _ = unistd::close(fd);
                if let Err(errno) = rebound {
                    return Failure::new(Stage::Rebind, index, errno);
                }
            }
        }
        unsafe { libc::execvp(self.binary.as_ptr(), argv.as_ptr()) };
        Failure::new(Stage::Exec, 0, Errno::last())
    }

    fn describe(&self, failure: Failure) -> Error {
        let errno = Errno::from_raw(failure.errno);
        match failure.stage {
            Stage::Exec if errno == Errno::ENOENT => Error::CommandNotFound(self.name()),
            Stage::Exec => Error::Exec {
                name: self.name(),
                errno,
            },
            Stage::Open => Error::Open {
                path: self
                    .fd_options
                    .get(failure.index as usize)
                    .map(|(_, option)| option.path().to_owned())
                    .unwrap_or_default(),
                errno,
            },
            Stage::Rebind => Error::Rebind(errno),
            Stage::Signal => Error::Signal(errno),
        }
    }
}

fn to_cstring(s: &OsStr) -> Result<CString, Error> {
    CString::new(s.as_bytes()).map_err(|_| Error::StringEncoding(s.to_os_string()))
}

/// Reads the error pipe to end of file. Nothing means the exec went through
/// and the close-on-exec write end was closed by it.
fn read_failure(reader: OwnedFd) -> io::Result<Option<Failure>> {
    let mut record = Vec::with_capacity(Failure::SIZE);
    File::from(reader).read_to_end(&mut record)?;
    if record.is_empty() {
        return Ok(None);
    }
    Failure::decode(&record)
        .map(Some)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "truncated launch report"))
}

#[derive(Debug)]
pub struct Child {
    pid: Pid,
    name: String,
}

impl Child {
    pub fn id(&self) -> Pid {
        self.pid
    }

    /// Blocks until the child exits or is killed by a signal. Stop and
    /// continue notifications do not end the wait.
    pub fn wait(self) -> Result<Status, Error> {
        loop {
            match wait::waitpid(self.pid, Some(WaitPidFlag::WUNTRACED)) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(Status::Exited(code)),
                Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(Status::Signaled(signal)),
                Ok(other) => trace!("{} ({}) still running: {:?}", self.name, self.pid, other),
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(Error::Wait(errno)),
            }
        }
    }
}

pub trait Executor {
    fn execute(&mut self, job: &Job) -> Result<Status, Error>;
}

/// Runs each job in a forked child and waits for it to finish.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkExec;

impl Executor for ForkExec {
    fn execute(&mut self, job: &Job) -> Result<Status, Error> {
        let child = job.spawn()?;
        let pid = child.id();
        let status = child.wait()?;
        debug!("{} ({}) finished: {:?}", job.name(), pid, status);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::syntax::{lexer, parser};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn job(line: &str) -> Job {
        job_from_bytes(line.as_bytes())
    }

    fn job_from_bytes(line: &[u8]) -> Job {
        let tokens = lexer::tokenize(line);
        let expr = parser::parse(&tokens).expect("line should parse");
        Job::from_expr(&expr).expect("line should convert")
    }

    fn run(line: &str) -> Result<Status, Error> {
        ForkExec.execute(&job(line))
    }

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path.to_str().unwrap().to_owned()
    }

    #[test]
    fn builds_argv_without_redirections() {
        let job = job("wc -l < in.txt > out.txt");
        assert_eq!(job.name(), "wc");
        assert_eq!(
            job.args(),
            &[CString::new("wc").unwrap(), CString::new("-l").unwrap()]
        );
        assert_eq!(
            job.fd_options(),
            &[
                (STDIN, FdOption::Input(CString::new("in.txt").unwrap())),
                (STDOUT, FdOption::Overwrite(CString::new("out.txt").unwrap())),
            ]
        );
    }

    #[test]
    fn rejects_nul_bytes() {
        let tokens = vec![OsString::from("echo"), OsString::from("a\0b")];
        let expr = parser::parse(&tokens).unwrap();
        assert!(matches!(
            Job::from_expr(&expr),
            Err(Error::StringEncoding(ref s)) if s == "a\0b"
        ));
    }

    #[test]
    fn failure_record_round_trip() {
        let failure = Failure::new(Stage::Open, 3, Errno::EACCES);
        assert_eq!(Failure::decode(&failure.encode()), Some(failure));
        assert_eq!(Failure::decode(&failure.encode()[..4]), None);
        assert_eq!(Failure::decode(&[9, 0, 0, 0, 0, 0, 0, 0, 0]), None);
    }

    #[test]
    fn signal_reset_failure_is_reported() {
        let failure = Failure::new(Stage::Signal, 0, Errno::EINVAL);
        assert_eq!(Failure::decode(&failure.encode()), Some(failure));
        match job("true").describe(failure) {
            err @ Error::Signal(Errno::EINVAL) => {
                assert_eq!(err.to_string(), "signal: Invalid argument")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn exit_status_is_reported() {
        assert_eq!(run("true").unwrap(), Status::Exited(0));
        assert_eq!(run("false").unwrap(), Status::Exited(1));

        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "three.sh", "exit 3\n");
        let status = run(&format!("sh {}", path)).unwrap();
        assert_eq!(status, Status::Exited(3));
        assert!(!status.success());
        assert_eq!(status.code(), 3);
    }

    #[test]
    fn output_redirection_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        fs::write(&out, "stale contents that are longer than the output\n").unwrap();

        let status = run(&format!("echo hello > {}", out.display())).unwrap();
        assert!(status.success());
        assert_eq!(fs::read_to_string(&out).unwrap(), "hello\n");
    }

    #[test]
    fn output_file_is_created_with_0644() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("new.txt");
        run(&format!("echo hi > {}", out.display())).unwrap();
        let mode = fs::metadata(&out).unwrap().permissions().mode() & 0o777;
        // the process umask can only clear bits
        assert_eq!(mode & !0o644, 0);
        assert_eq!(mode & 0o600, 0o600);
    }

    #[test]
    fn input_redirection_feeds_program() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        let out = dir.path().join("count.txt");
        fs::write(&input, "a\nb\nc\n").unwrap();

        let status = run(&format!("wc -l < {} > {}", input.display(), out.display())).unwrap();
        assert!(status.success());
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "3");
    }

    #[test]
    fn last_output_redirection_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.txt");
        let second = dir.path().join("second.txt");
        fs::write(&first, "old\n").unwrap();

        run(&format!("echo hi > {} > {}", first.display(), second.display())).unwrap();
        // the earlier file is still opened, so it ends up truncated
        assert_eq!(fs::read_to_string(&first).unwrap(), "");
        assert_eq!(fs::read_to_string(&second).unwrap(), "hi\n");
    }

    #[test]
    fn last_input_redirection_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.txt");
        let second = dir.path().join("second.txt");
        let out = dir.path().join("out.txt");
        fs::write(&first, "first\n").unwrap();
        fs::write(&second, "second\n").unwrap();

        run(&format!(
            "cat < {} < {} > {}",
            first.display(),
            second.display(),
            out.display()
        ))
        .unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "second\n");
    }

    #[test]
    fn file_names_keep_their_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join(OsStr::from_bytes(b"f\xff.txt"));
        let out = dir.path().join(OsStr::from_bytes(b"\xfeout.txt"));
        fs::write(&input, "data\n").unwrap();

        let mut line = b"cat < ".to_vec();
        line.extend_from_slice(input.as_os_str().as_bytes());
        line.extend_from_slice(b" > ");
        line.extend_from_slice(out.as_os_str().as_bytes());
        let status = ForkExec.execute(&job_from_bytes(&line)).unwrap();
        assert!(status.success());
        assert_eq!(fs::read_to_string(&out).unwrap(), "data\n");
    }

    #[test]
    fn arguments_keep_their_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.bin");
        let mut line = b"printf %s \xe9t\xe9 > ".to_vec();
        line.extend_from_slice(out.as_os_str().as_bytes());
        ForkExec.execute(&job_from_bytes(&line)).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"\xe9t\xe9");
    }

    #[test]
    fn missing_command() {
        match run("doesnotexist123 --flag") {
            Err(Error::CommandNotFound(name)) => assert_eq!(name, "doesnotexist123"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(
            Error::CommandNotFound(String::from("doesnotexist123")).to_string(),
            "command not found: doesnotexist123"
        );
    }

    #[test]
    fn missing_command_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nothing-here");
        assert!(matches!(
            run(&path.display().to_string()),
            Err(Error::CommandNotFound(_))
        ));
    }

    #[test]
    fn non_executable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "plain.txt", "not a program\n");
        match run(&path) {
            Err(err @ Error::Exec { .. }) => {
                assert_eq!(err.to_string(), format!("{}: Permission denied", path));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn missing_input_file_stops_the_launch() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");
        let out = dir.path().join("out.txt");

        match run(&format!("cat < {} > {}", missing.display(), out.display())) {
            Err(err @ Error::Open { .. }) => {
                assert_eq!(
                    err.to_string(),
                    format!("{}: No such file or directory", missing.display())
                );
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // options after the failing one are never applied
        assert!(!out.exists());
    }

    #[test]
    fn output_into_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("no").join("such").join("dir.txt");
        assert!(matches!(
            run(&format!("echo hi > {}", out.display())),
            Err(Error::Open { errno: Errno::ENOENT, .. })
        ));
    }

    #[test]
    fn signaled_child() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "term.sh", "kill -TERM $$\nsleep 5\n");
        let status = run(&format!("sh {}", path)).unwrap();
        assert_eq!(status, Status::Signaled(Signal::SIGTERM));
        assert_eq!(status.code(), 128 + 15);
    }

    #[test]
    fn stopped_child_is_not_finished() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "stop.sh", "kill -STOP $$\nexit 7\n");
        let child = job(&format!("sh {}", path)).spawn().unwrap();
        let pid = child.id();

        let done = Arc::new(AtomicBool::new(false));
        let resumer = {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(50));
                    if !done.load(Ordering::SeqCst) {
                        let _ = signal::kill(pid, Signal::SIGCONT);
                    }
                }
            })
        };

        let status = child.wait();
        done.store(true, Ordering::SeqCst);
        resumer.join().unwrap();
        assert_eq!(status.unwrap(), Status::Exited(7));
    }

    #[test]
    fn redirection_stays_in_child() {
        use std::os::unix::io::AsRawFd;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let before = fs::read_link(format!("/proc/self/fd/{}", io::stdout().as_raw_fd())).ok();
        run(&format!("echo child > {}", out.display())).unwrap();
        let after = fs::read_link(format!("/proc/self/fd/{}", io::stdout().as_raw_fd())).ok();
        assert_eq!(before, after);
    }
}
