use std::future::poll_fn;
use std::os::fd::{AsRawFd, OwnedFd};
use std::task::Poll;

use anyhow::Context as _;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tokio::io::unix::AsyncFd;

use crate::monitor::log::{log_err, log_msg, Severity};

const READ_BUF_SIZE: usize = 4096;

/// Which half of a child's output a pipe carries. stdout lines are logged at
/// INFO, stderr lines at ERR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn severity(self) -> Severity {
        match self {
            OutputStream::Stdout => Severity::Info,
            OutputStream::Stderr => Severity::Err,
        }
    }
}

/// Registration handle for one Command's pipe pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeToken(u64);

/// The write ends handed to every child launched for a Command, plus the
/// token that unregisters the matching read ends. Both ends stay open in the
/// supervisor for the Command's lifetime so the read side never sees EOF
/// across child restarts.
#[derive(Debug)]
pub struct CommandPipes {
    pub token: PipeToken,
    pub stdout_write: OwnedFd,
    pub stderr_write: OwnedFd,
}

struct PipeEntry {
    token: PipeToken,
    stream: OutputStream,
    label: String,
    afd: AsyncFd<OwnedFd>,
}

/// All pipe read ends the event loop is waiting on.
///
/// The supervisor owns the registrations; Commands hold only a
/// [`PipeToken`]. Registration and removal are paired with Command creation
/// and destruction.
#[derive(Default)]
pub struct OutputPipes {
    entries: Vec<PipeEntry>,
    next_token: u64,
    cursor: usize,
}

impl OutputPipes {
    pub fn new() -> OutputPipes {
        OutputPipes::default()
    }

    /// Create the stdout/stderr pipe pair for a Command and register both
    /// read ends. `label` is the `class.id` prefix used for log records.
    pub fn register(&mut self, label: &str) -> anyhow::Result<CommandPipes> {
        let token = PipeToken(self.next_token);
        self.next_token += 1;

        let (stdout_read, stdout_write) =
            nix::unistd::pipe().with_context(|| format!("pipe for {label}"))?;
        let (stderr_read, stderr_write) =
            nix::unistd::pipe().with_context(|| format!("pipe for {label}"))?;

        for (stream, read_end) in [
            (OutputStream::Stdout, stdout_read),
            (OutputStream::Stderr, stderr_read),
        ] {
            set_nonblocking(&read_end)?;
            let afd = AsyncFd::new(read_end).with_context(|| format!("register pipe for {label}"))?;
            self.entries.push(PipeEntry {
                token,
                stream,
                label: label.to_string(),
                afd,
            });
        }

        Ok(CommandPipes {
            token,
            stdout_write,
            stderr_write,
        })
    }

    /// Drop every read end registered under `token`.
    pub fn unregister(&mut self, token: PipeToken) {
        self.entries.retain(|e| e.token != token);
        self.cursor = 0;
    }

    pub fn registered_read_ends(&self) -> usize {
        self.entries.len()
    }

    /// Wait until some registered read end is readable and return its index.
    /// Pends forever when nothing is registered. Scanning starts after the
    /// last serviced entry so one chatty child cannot starve the rest.
    pub async fn next_ready(&self) -> usize {
        poll_fn(|cx| {
            let n = self.entries.len();
            if n == 0 {
                return Poll::Pending;
            }
            for off in 0..n {
                let idx = (self.cursor + 1 + off) % n;
                if let Poll::Ready(result) = self.entries[idx].afd.poll_read_ready(cx) {
                    match result {
                        // Leave readiness set; drain() consumes it.
                        Ok(_guard) => return Poll::Ready(idx),
                        Err(_) => return Poll::Ready(idx),
                    }
                }
            }
            Poll::Pending
        })
        .await
    }

    /// Perform one bounded read on the entry at `idx`, emitting one log
    /// record per line. EINTR is left for the next loop iteration; any other
    /// read failure permanently unregisters this pipe.
    pub async fn drain(&mut self, idx: usize) {
        if idx >= self.entries.len() {
            return;
        }
        self.cursor = idx;

        let mut buf = [0u8; READ_BUF_SIZE];
        let (severity, label) = {
            let entry = &self.entries[idx];
            (entry.stream.severity(), entry.label.clone())
        };

        enum ReadOutcome {
            Data(usize),
            Eof,
            Interrupted,
            Stale,
            Failed(std::io::Error),
        }

        let outcome = {
            let entry = &self.entries[idx];
            match entry.afd.readable().await {
                Err(e) => ReadOutcome::Failed(e),
                Ok(mut guard) => {
                    let r = guard.try_io(|inner| {
                        let n = unsafe {
                            libc::read(
                                inner.get_ref().as_raw_fd(),
                                buf.as_mut_ptr() as *mut libc::c_void,
                                buf.len(),
                            )
                        };
                        if n < 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                        Ok(n as usize)
                    });
                    match r {
                        Ok(Ok(0)) => ReadOutcome::Eof,
                        Ok(Ok(n)) => ReadOutcome::Data(n),
                        Ok(Err(e)) if e.raw_os_error() == Some(libc::EINTR) => {
                            ReadOutcome::Interrupted
                        }
                        Ok(Err(e)) => ReadOutcome::Failed(e),
                        Err(_would_block) => ReadOutcome::Stale,
                    }
                }
            }
        };

        match outcome {
            ReadOutcome::Data(n) => {
                for record in split_records(&buf[..n]) {
                    log_msg(severity, format!("{label}: {record}"));
                }
            }
            ReadOutcome::Eof => {
                // EOF means our own write end is gone, which only happens as
                // part of Command teardown.
                self.entries.remove(idx);
            }
            ReadOutcome::Interrupted => {
                // Readiness stays set; retried on the next wakeup.
            }
            ReadOutcome::Stale => {
                // Readiness was stale; cleared by try_io.
            }
            ReadOutcome::Failed(e) => {
                log_err(
                    "read",
                    &e,
                    format!("Error while reading from {label}, no longer logging output"),
                );
                self.entries.remove(idx);
            }
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> anyhow::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Split one read's worth of bytes into log records at newline boundaries.
/// A trailing partial line becomes its own record; there is no buffering
/// across reads.
fn split_records(buf: &[u8]) -> Vec<String> {
    buf.split_inclusive(|&b| b == b'\n')
        .map(|chunk| {
            let line = chunk.strip_suffix(b"\n").unwrap_or(chunk);
            String::from_utf8_lossy(line).into_owned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write as _;

    #[test]
    fn records_split_at_newlines() {
        assert_eq!(split_records(b"one\ntwo\n"), vec!["one", "two"]);
        assert_eq!(split_records(b"one\npartial"), vec!["one", "partial"]);
        assert_eq!(split_records(b"no newline"), vec!["no newline"]);
        assert_eq!(split_records(b"\n\n"), vec!["", ""]);
    }

    #[tokio::test]
    async fn registration_accounts_two_read_ends_per_command() {
        let mut pipes = OutputPipes::new();
        let a = pipes.register("worker.1").unwrap();
        let b = pipes.register("worker.2").unwrap();
        assert_eq!(pipes.registered_read_ends(), 4);

        pipes.unregister(a.token);
        assert_eq!(pipes.registered_read_ends(), 2);
        pipes.unregister(b.token);
        assert_eq!(pipes.registered_read_ends(), 0);
    }

    #[tokio::test]
    async fn ready_pipe_is_found_and_drained() {
        let mut pipes = OutputPipes::new();
        let handles = pipes.register("worker.1").unwrap();

        let mut writer = std::fs::File::from(handles.stdout_write.try_clone().unwrap());
        writer.write_all(b"hello\n").unwrap();

        let idx = pipes.next_ready().await;
        assert_eq!(pipes.entries[idx].stream, OutputStream::Stdout);
        pipes.drain(idx).await;

        // Nothing left to read; a fresh write wakes it again.
        writer.write_all(b"again\n").unwrap();
        let idx = pipes.next_ready().await;
        pipes.drain(idx).await;
    }
}
