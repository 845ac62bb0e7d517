//! Run one program as a restricted identity under a hard timeout.
//!
//! The program gets its own process group so the whole tree can be killed
//! at once: on timeout, and again after the main process exits so nothing it
//! left behind keeps running or holds the output pipes open.
//!
//! Exec follows shell conventions: a file without a usable `#!` line is
//! run by `/bin/sh`, and a program that cannot be executed ends with 127
//! (not found) or 126 (not executable) and the OS error on stderr. Only
//! failures to set up the process itself are errors.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{Pid, User};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::SandboxError;

/// Return code recorded for a run that hit its timeout.
pub const TIMEOUT_RETURN_CODE: i32 = -9;

/// Interpreter for programs the kernel refuses to exec directly.
const FALLBACK_SHELL: &str = "/bin/sh";

const NOT_FOUND_RETURN_CODE: i32 = 127;
const NOT_EXECUTABLE_RETURN_CODE: i32 = 126;

/// Unprivileged uid/gid the program runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    /// Resolve a user name from the system user database.
    pub fn lookup(name: &str) -> Result<Self, SandboxError> {
        match User::from_name(name) {
            Ok(Some(user)) => Ok(Self {
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
            }),
            Ok(None) => Err(SandboxError::UnknownUser(name.to_string())),
            Err(source) => Err(SandboxError::UserLookup {
                name: name.to_string(),
                source,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub timeout: Duration,
    /// Bytes kept from each of stdout and stderr.
    pub output_limit: usize,
    /// How long to wait for the pipes to close after the program is gone.
    pub drain_grace: Duration,
}

/// How the program ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Code(i32),
    Signal(i32),
    TimedOut,
}

impl Exit {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Code(code),
            (None, Some(signal)) => Self::Signal(signal),
            (None, None) => Self::Code(-1),
        }
    }

    /// Exit code as stored: signals are negated, timeouts are reserved.
    pub const fn return_code(self) -> i32 {
        match self {
            Self::Code(code) => code,
            Self::Signal(signal) => -signal,
            Self::TimedOut => TIMEOUT_RETURN_CODE,
        }
    }
}

#[derive(Debug)]
pub struct Completion {
    pub exit: Exit,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Run `program` in `cwd`, as `identity` if given.
pub async fn run(
    program: &Path,
    cwd: &Path,
    identity: Option<Identity>,
    limits: Limits,
) -> Result<Completion, SandboxError> {
    let started = match spawn(&mut command(program, &[], cwd, identity)).await {
        Err(e) if e.raw_os_error() == Some(Errno::ENOEXEC as i32) => {
            debug!("No usable interpreter line; running through {FALLBACK_SHELL}");
            let shell = Path::new(FALLBACK_SHELL);
            spawn(&mut command(shell, &[program], cwd, identity)).await
        }
        started => started,
    };
    let mut child = match started {
        Ok(child) => child,
        Err(e) => return unstartable(program, e),
    };

    let group = child
        .id()
        .and_then(|pid| i32::try_from(pid).ok())
        .map(Pid::from_raw);
    debug!(pid = ?child.id(), "Started sandboxed script");

    let (stop, stopped) = watch::channel(false);
    let mut stdout = tokio::spawn(capture(child.stdout.take(), limits.output_limit, stopped.clone()));
    let mut stderr = tokio::spawn(capture(child.stderr.take(), limits.output_limit, stopped));

    let exit = if let Ok(status) = tokio::time::timeout(limits.timeout, child.wait()).await {
        Exit::from_status(status.map_err(SandboxError::Supervise)?)
    } else {
        debug!(timeout = ?limits.timeout, "Sandboxed script timed out");
        kill_group(group);
        child.kill().await.ok();
        child.wait().await.map_err(SandboxError::Supervise)?;
        Exit::TimedOut
    };
    kill_group(group);

    let drained = tokio::time::timeout(limits.drain_grace, async {
        tokio::join!(&mut stdout, &mut stderr)
    })
    .await;
    let (stdout, stderr) = if let Ok(pair) = drained {
        pair
    } else {
        warn!("Output pipes still open after the script exited; keeping what was read");
        stop.send(true).ok();
        tokio::join!(stdout, stderr)
    };

    Ok(Completion {
        exit,
        stdout: joined(stdout)?,
        stderr: joined(stderr)?,
    })
}

fn command(program: &Path, args: &[&Path], cwd: &Path, identity: Option<Identity>) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(identity) = identity {
        cmd.uid(identity.uid).gid(identity.gid);
    }
    cmd
}

/// Turn an exec failure of the program into an ordinary completion.
/// Anything else went wrong before exec and is an error.
fn unstartable(program: &Path, e: io::Error) -> Result<Completion, SandboxError> {
    let code = match e.raw_os_error().map(Errno::from_raw) {
        Some(Errno::ENOENT | Errno::ENOTDIR) => NOT_FOUND_RETURN_CODE,
        Some(
            Errno::EACCES
            | Errno::ENOEXEC
            | Errno::ETXTBSY
            | Errno::ELOOP
            | Errno::EISDIR
            | Errno::ELIBBAD
            | Errno::ENAMETOOLONG,
        ) => NOT_EXECUTABLE_RETURN_CODE,
        _ => return Err(SandboxError::Spawn(e)),
    };
    let name = program.file_name().unwrap_or(program.as_os_str());
    debug!(code, error = %e, "Sandboxed script could not be executed");
    Ok(Completion {
        exit: Exit::Code(code),
        stdout: Vec::new(),
        stderr: format!("{}: cannot execute: {e}\n", name.to_string_lossy()).into_bytes(),
    })
}

/// Spawn, retrying briefly while the freshly written script is still open
/// in a concurrently forked process.
async fn spawn(cmd: &mut Command) -> io::Result<Child> {
    let mut attempts = 0;
    loop {
        match cmd.spawn() {
            Err(e) if e.raw_os_error() == Some(Errno::ETXTBSY as i32) && attempts < 10 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            result => return result,
        }
    }
}

fn kill_group(group: Option<Pid>) {
    let Some(group) = group else { return };
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = group.as_raw(), error = %e, "Failed to kill process group"),
    }
}

fn joined(
    result: Result<io::Result<Vec<u8>>, tokio::task::JoinError>,
) -> Result<Vec<u8>, SandboxError> {
    result
        .map_err(|e| SandboxError::Supervise(io::Error::other(e)))?
        .map_err(SandboxError::Supervise)
}

/// Read until EOF or `stop`, keeping at most `limit` bytes and discarding
/// the rest so the writer never blocks on a full pipe.
async fn capture<R>(
    reader: Option<R>,
    limit: usize,
    mut stop: watch::Receiver<bool>,
) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        tokio::select! {
            read = reader.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
            _ = stop.changed() => break,
        }
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn limits(timeout_secs: u64) -> Limits {
        Limits {
            timeout: Duration::from_secs(timeout_secs),
            output_limit: 1024,
            drain_grace: Duration::from_millis(500),
        }
    }

    fn sh(dir: &Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("run.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = sh(dir.path(), "echo out; echo err >&2; exit 3");
        let done = run(&script, dir.path(), None, limits(5)).await.unwrap();

        assert_eq!(done.exit, Exit::Code(3));
        assert_eq!(done.stdout, b"out\n");
        assert_eq!(done.stderr, b"err\n");
    }

    #[tokio::test]
    async fn runs_in_the_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("input.txt"), "42").unwrap();
        let script = sh(dir.path(), "cat input.txt");
        let done = run(&script, dir.path(), None, limits(5)).await.unwrap();

        assert_eq!(done.stdout, b"42");
    }

    #[tokio::test]
    async fn timeout_kills_the_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let script = sh(dir.path(), "sleep 30 & sleep 30");
        let started = Instant::now();
        let done = run(&script, dir.path(), None, limits(1)).await.unwrap();

        assert_eq!(done.exit, Exit::TimedOut);
        assert_eq!(done.exit.return_code(), TIMEOUT_RETURN_CODE);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn background_stragglers_do_not_hold_the_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let script = sh(dir.path(), "sleep 30 &\necho done");
        let started = Instant::now();
        let done = run(&script, dir.path(), None, limits(20)).await.unwrap();

        assert_eq!(done.exit, Exit::Code(0));
        assert_eq!(done.stdout, b"done\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn output_is_capped_per_stream() {
        let dir = tempfile::tempdir().unwrap();
        let script = sh(
            dir.path(),
            "i=0; while [ $i -lt 500 ]; do echo 0123456789; i=$((i+1)); done",
        );
        let done = run(&script, dir.path(), None, limits(5)).await.unwrap();

        assert_eq!(done.exit, Exit::Code(0));
        assert_eq!(done.stdout.len(), 1024);
    }

    #[tokio::test]
    async fn signal_deaths_are_negated() {
        let dir = tempfile::tempdir().unwrap();
        let script = sh(dir.path(), "kill -TERM $$");
        let done = run(&script, dir.path(), None, limits(5)).await.unwrap();

        assert_eq!(done.exit, Exit::Signal(15));
        assert_eq!(done.exit.return_code(), -15);
    }

    fn raw(dir: &Path, contents: &str, mode: u32) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("raw");
        std::fs::write(&path, contents).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[tokio::test]
    async fn missing_program_exits_127() {
        let dir = tempfile::tempdir().unwrap();
        let done = run(&dir.path().join("absent"), dir.path(), None, limits(5))
            .await
            .unwrap();

        assert_eq!(done.exit, Exit::Code(127));
        let stderr = String::from_utf8(done.stderr).unwrap();
        assert!(stderr.starts_with("absent: cannot execute"), "{stderr}");
    }

    #[tokio::test]
    async fn file_without_interpreter_line_runs_under_sh() {
        let dir = tempfile::tempdir().unwrap();
        let program = raw(dir.path(), "echo plain\nexit 4\n", 0o755);
        let done = run(&program, dir.path(), None, limits(5)).await.unwrap();

        assert_eq!(done.exit, Exit::Code(4));
        assert_eq!(done.stdout, b"plain\n");
    }

    #[tokio::test]
    async fn non_executable_file_exits_126() {
        let dir = tempfile::tempdir().unwrap();
        let program = raw(dir.path(), "#!/bin/sh\necho never\n", 0o644);
        let done = run(&program, dir.path(), None, limits(5)).await.unwrap();

        // No execute bit at all, so this holds for root too.
        assert_eq!(done.exit, Exit::Code(126));
        assert!(done.stdout.is_empty());
    }

    #[test]
    fn identity_lookup() {
        assert_eq!(Identity::lookup("root").unwrap().uid, 0);
        assert!(matches!(
            Identity::lookup("no-such-demograder-user"),
            Err(SandboxError::UnknownUser(_))
        ));
    }
}
