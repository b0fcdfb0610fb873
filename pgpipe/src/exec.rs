//! Launching the tool and exchanging data with it.
//!
//! One call owns one child process and up to four pipes: bulk data in,
//! passphrase in, result out, diagnostics out. The pipes are serviced by a
//! single poll loop that feeds the write sides in pipe-sized chunks while
//! draining the read sides. Feeding everything up front would deadlock: the
//! kernel's pipe buffers are bounded, and a tool that blocks writing its
//! output while we block writing its input stalls both processes forever.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{pipe2, Pid};
use secrecy::{ExposeSecret, SecretString};

use crate::backend::CommandLine;
use crate::error::Error;

/// Bound on a single readiness wait. The exchange is abandoned if the tool
/// makes no progress at all within this window.
const EXCHANGE_TIMEOUT_MS: u16 = 10_000;

/// Seconds form of [`EXCHANGE_TIMEOUT_MS`], for diagnostics.
pub(crate) const EXCHANGE_TIMEOUT_SECS: u64 = EXCHANGE_TIMEOUT_MS as u64 / 1000;

/// How long to wait for the child to exit on its own. PGP 5 closes its
/// descriptors before exiting, so the exchange loop can finish while the
/// process is still shutting down.
const REAP_GRACE: Duration = Duration::from_secs(1);

/// How long to wait after each termination signal.
const SIGNAL_GRACE: Duration = Duration::from_secs(1);

/// Interval between non-blocking wait attempts during a grace period.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Read granularity for the result channel.
const OUTPUT_READ_CHUNK: usize = 4096;

/// Read granularity for the diagnostics channel.
const DIAG_READ_CHUNK: usize = 1024;

/// Write granularity when the pipe's atomic capacity cannot be queried.
const FALLBACK_PIPE_BUF: usize = 1024;

/// The dedicated channel carrying the passphrase into the child, outside
/// of argv and outside the parent's environment.
pub(crate) struct PassphrasePipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl PassphrasePipe {
    /// Creates the pipe. Both ends are close-on-exec; the child end is
    /// re-enabled between fork and exec, so exactly one descriptor crosses
    /// into the tool and none leaks into concurrently spawned children.
    pub(crate) fn create() -> nix::Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(PassphrasePipe { read, write })
    }

    /// The descriptor number the child will read the passphrase from.
    /// Inheritance preserves numbering, so the parent-side number is
    /// already correct for argv and environment hand-off.
    pub(crate) fn child_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

/// What came back from one run of the tool.
pub(crate) struct Outcome {
    pub(crate) output: Vec<u8>,
    pub(crate) diagnostics: Vec<u8>,
    pub(crate) status: ExitOutcome,
    pub(crate) timed_out: bool,
}

impl Outcome {
    /// A run succeeded only if the tool exited cleanly *and* produced
    /// output; an empty result with a zero status is still a failure.
    pub(crate) fn succeeded(&self) -> bool {
        matches!(self.status, ExitOutcome::Exited(0)) && !self.output.is_empty()
    }
}

/// How the child ended.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ExitOutcome {
    /// Normal exit with the given code.
    Exited(i32),
    /// Killed by a signal, or the wait machinery itself failed.
    Failed,
}

/// Runs the tool and drives the data exchange to completion.
///
/// `passphrase` pairs the pipe whose read end is already referenced by the
/// command line with the secret to send down it. The child is always
/// reaped before this returns, whatever happened to the exchange.
pub(crate) fn exchange(
    program: &Path,
    command: CommandLine,
    input: &[u8],
    passphrase: Option<(PassphrasePipe, &SecretString)>,
) -> Result<Outcome, Error> {
    let mut cmd = Command::new(program);
    cmd.args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    if let Some(arg0) = command.arg0 {
        cmd.arg0(arg0);
    }

    let pass_fd = passphrase.as_ref().map(|(pipe, _)| pipe.read.as_raw_fd());
    unsafe {
        cmd.pre_exec(move || {
            // Detach from the controlling terminal. PGP 2 falls back to
            // prompting on /dev/tty when the piped passphrase is wrong,
            // which would hang forever in a session without one; in a new
            // session the fallback fails instead.
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            // Only the passphrase descriptor may survive the exec.
            if let Some(fd) = pass_fd {
                if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    debug!("running {} {:?}", program.display(), command.args);
    let mut child = cmd.spawn().map_err(|source| Error::Launch {
        binary: program.display().to_string(),
        source,
    })?;

    // `spawn` already closed the child's ends of the stdio pipes in this
    // process; drop our copy of the passphrase read end likewise, so the
    // child observes EOF once the write end is done.
    let (pass_sink, secret) = match passphrase {
        Some((PassphrasePipe { read, write }, secret)) => {
            drop(read);
            (Some(File::from(write)), Some(secret))
        }
        None => (None, None),
    };

    let captured = multiplex(&mut child, input, pass_sink, secret);
    let status = reap(&mut child);
    debug!("{} finished: {:?}", program.display(), status);

    Ok(Outcome {
        output: captured.output,
        diagnostics: captured.diagnostics,
        status,
        timed_out: captured.timed_out,
    })
}

struct Captured {
    output: Vec<u8>,
    diagnostics: Vec<u8>,
    timed_out: bool,
}

/// The readiness loop. Returns once both read channels reached
/// end-of-stream, or earlier if the exchange has to be abandoned; either
/// way every pipe this call owns is closed when it returns.
fn multiplex(
    child: &mut Child,
    input: &[u8],
    pass_sink: Option<File>,
    secret: Option<&SecretString>,
) -> Captured {
    let mut stdout = child.stdout.take().expect("stdout is piped");
    let mut stderr = child.stderr.take().expect("stderr is piped");
    let stdin = child.stdin.take().expect("stdin is piped");

    let mut output = Vec::with_capacity(OUTPUT_READ_CHUNK);
    let mut diagnostics = Vec::with_capacity(DIAG_READ_CHUNK);
    let mut out_eof = false;
    let mut diag_eof = false;
    let mut timed_out = false;

    let pass_chunk = pass_sink.as_ref().map(pipe_capacity).unwrap_or(FALLBACK_PIPE_BUF);
    let mut pass_remaining: &[u8] = secret
        .map(|secret| secret.expose_secret().as_bytes())
        .unwrap_or(&[]);
    let mut pass_sink = pass_sink;
    if pass_remaining.is_empty() {
        // Nothing to send; close at once so the tool sees EOF.
        pass_sink = None;
    }

    let input_chunk = pipe_capacity(&stdin);
    let mut input_remaining = input;
    let mut input_sink = Some(stdin);
    if input_remaining.is_empty() {
        input_sink = None;
    }

    while !(out_eof && diag_eof) {
        // Rebuild the poll set each round; channels leave it as they
        // reach EOF or run out of bytes to send.
        let mut fds = Vec::with_capacity(4);
        let mut out_slot = None;
        let mut diag_slot = None;
        let mut pass_slot = None;
        let mut input_slot = None;

        if !out_eof {
            out_slot = Some(fds.len());
            fds.push(PollFd::new(stdout.as_fd(), PollFlags::POLLIN));
        }
        if !diag_eof {
            diag_slot = Some(fds.len());
            fds.push(PollFd::new(stderr.as_fd(), PollFlags::POLLIN));
        }
        if let Some(sink) = &pass_sink {
            pass_slot = Some(fds.len());
            fds.push(PollFd::new(sink.as_fd(), PollFlags::POLLOUT));
        }
        if let Some(sink) = &input_sink {
            input_slot = Some(fds.len());
            fds.push(PollFd::new(sink.as_fd(), PollFlags::POLLOUT));
        }

        match poll(&mut fds, PollTimeout::from(EXCHANGE_TIMEOUT_MS)) {
            Ok(0) => {
                warn!(
                    "tool made no progress within {} seconds; abandoning the exchange",
                    EXCHANGE_TIMEOUT_SECS
                );
                timed_out = true;
                break;
            }
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }

        let ready = |slot: Option<usize>| {
            slot.and_then(|index| fds[index].revents())
                .map(|revents| !revents.is_empty())
                .unwrap_or(false)
        };
        let out_ready = ready(out_slot);
        let diag_ready = ready(diag_slot);
        let pass_ready = ready(pass_slot);
        let input_ready = ready(input_slot);
        drop(fds);

        // Service the read sides first: when the child has already exited,
        // its last output is sitting in the pipes and must be captured
        // before a failing write aborts the loop.
        if out_ready && !drain(&mut stdout, &mut output, OUTPUT_READ_CHUNK, &mut out_eof) {
            break;
        }
        if diag_ready && !drain(&mut stderr, &mut diagnostics, DIAG_READ_CHUNK, &mut diag_eof) {
            break;
        }
        if pass_ready && !feed(&mut pass_sink, &mut pass_remaining, pass_chunk) {
            break;
        }
        if input_ready && !feed(&mut input_sink, &mut input_remaining, input_chunk) {
            break;
        }
    }

    Captured {
        output,
        diagnostics,
        timed_out,
    }
}

/// Bounded read of one chunk into a growing buffer. A zero-length read
/// marks end-of-stream. Returns `false` when the exchange must abort.
fn drain(
    source: &mut impl Read,
    buffer: &mut Vec<u8>,
    chunk: usize,
    eof: &mut bool,
) -> bool {
    let mut scratch = [0u8; OUTPUT_READ_CHUNK];
    match source.read(&mut scratch[..chunk]) {
        Ok(0) => {
            *eof = true;
            true
        }
        Ok(count) => {
            buffer.extend_from_slice(&scratch[..count]);
            true
        }
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => true,
        Err(_) => false,
    }
}

/// Bounded write of one chunk; the sink is dropped (closing the pipe, so
/// the tool sees EOF) once nothing remains. Returns `false` when the
/// exchange must abort.
fn feed<W: Write>(sink: &mut Option<W>, remaining: &mut &[u8], chunk: usize) -> bool {
    let pending = *remaining;
    let take = pending.len().min(chunk);
    let result = match sink.as_mut() {
        Some(writer) => writer.write(&pending[..take]),
        None => return true,
    };
    match result {
        Ok(count) => {
            *remaining = &pending[count..];
            if remaining.is_empty() {
                *sink = None;
            }
            true
        }
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => true,
        Err(_) => false,
    }
}

/// The pipe's atomic-write capacity, used as the write granularity.
fn pipe_capacity<F: AsFd>(sink: &F) -> usize {
    // SAFETY: fpathconf only inspects the descriptor.
    let capacity = unsafe {
        libc::fpathconf(sink.as_fd().as_raw_fd(), libc::_PC_PIPE_BUF)
    };
    if capacity > 0 {
        capacity as usize
    } else {
        FALLBACK_PIPE_BUF
    }
}

enum Reaped {
    Status(WaitStatus),
    StillAlive,
    Error,
}

/// Waits for the child, escalating to SIGTERM and then SIGKILL if it
/// lingers. Runs on every exit path so no zombie is left behind.
fn reap(child: &mut Child) -> ExitOutcome {
    let pid = Pid::from_raw(child.id() as i32);

    let mut attempt = wait_with_deadline(pid, REAP_GRACE);
    if matches!(attempt, Reaped::StillAlive) {
        warn!("child {} is lingering; sending SIGTERM", pid);
        let _ = kill(pid, Signal::SIGTERM);
        attempt = wait_with_deadline(pid, SIGNAL_GRACE);
    }
    if matches!(attempt, Reaped::StillAlive) {
        warn!("child {} ignored SIGTERM; sending SIGKILL", pid);
        let _ = kill(pid, Signal::SIGKILL);
        attempt = wait_with_deadline(pid, SIGNAL_GRACE);
    }

    match attempt {
        Reaped::Status(WaitStatus::Exited(_, code)) => ExitOutcome::Exited(code),
        _ => ExitOutcome::Failed,
    }
}

/// Non-blocking wait, retried until `grace` has elapsed.
fn wait_with_deadline(pid: Pid, grace: Duration) -> Reaped {
    let deadline = Instant::now() + grace;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    return Reaped::StillAlive;
                }
                thread::sleep(REAP_POLL_INTERVAL);
            }
            Ok(status) => return Reaped::Status(status),
            Err(Errno::EINTR) => continue,
            Err(_) => return Reaped::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{drain, feed, ExitOutcome, Outcome};

    #[test]
    fn feed_sends_bounded_chunks_and_closes_when_done() {
        let mut sink = Some(Vec::new());
        let mut remaining: &[u8] = b"0123456789";

        assert!(feed(&mut sink, &mut remaining, 4));
        assert_eq!(remaining, &b"456789"[..]);
        assert!(sink.is_some());

        assert!(feed(&mut sink, &mut remaining, 4));
        assert!(feed(&mut sink, &mut remaining, 4));
        assert!(remaining.is_empty());
        // The sink is dropped once everything went out, closing the pipe.
        assert!(sink.is_none());
    }

    #[test]
    fn feed_on_a_finished_channel_is_a_no_op() {
        let mut sink: Option<Vec<u8>> = None;
        let mut remaining: &[u8] = b"";
        assert!(feed(&mut sink, &mut remaining, 1024));
    }

    #[test]
    fn drain_grows_the_buffer_and_flags_eof() {
        let data = vec![7u8; 5000];
        let mut source = Cursor::new(data.clone());
        let mut buffer = Vec::new();
        let mut eof = false;

        while !eof {
            assert!(drain(&mut source, &mut buffer, 4096, &mut eof));
        }
        assert_eq!(buffer, data);
    }

    #[test]
    fn success_needs_a_clean_exit_and_output() {
        let outcome = |status, output: &[u8]| Outcome {
            output: output.to_vec(),
            diagnostics: Vec::new(),
            status,
            timed_out: false,
        };

        assert!(outcome(ExitOutcome::Exited(0), b"data").succeeded());
        assert!(!outcome(ExitOutcome::Exited(0), b"").succeeded());
        assert!(!outcome(ExitOutcome::Exited(2), b"data").succeeded());
        assert!(!outcome(ExitOutcome::Failed, b"data").succeeded());
    }
}
