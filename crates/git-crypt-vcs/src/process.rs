//! Child-process channel for invoking git.
//!
//! Three shapes of invocation: run with inherited stdio, capture stdout, or
//! stream bytes to stdin while capturing stdout. The last one drains the
//! child's stdout on its own thread — a write-then-read loop deadlocks as
//! soon as the child emits more than a pipe buffer while still waiting for
//! input. The child's stderr is inherited in every shape so git's own
//! diagnostics reach the user unmangled.

use std::ffi::OsString;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;

use tracing::debug;

use git_crypt_core::{GitCryptError, Result};

/// Builder for one git invocation.
pub struct Git {
    args: Vec<OsString>,
    dir: Option<PathBuf>,
}

impl Git {
    pub fn new(dir: Option<&Path>) -> Self {
        Self {
            args: Vec::new(),
            dir: dir.map(Path::to_path_buf),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run with inherited stdio; succeeds iff git exits zero.
    pub fn run(self) -> Result<()> {
        debug!(command = %self.describe(), "running git");
        let status = self
            .command()
            .status()
            .map_err(|e| GitCryptError::io_stream("spawning", "git", e))?;
        self.ensure_success(status)
    }

    /// Run with captured stdout and inherited stderr.
    pub fn output(self) -> Result<Vec<u8>> {
        debug!(command = %self.describe(), "running git");
        let out = self
            .command()
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| GitCryptError::io_stream("spawning", "git", e))?;
        self.ensure_success(out.status)?;
        Ok(out.stdout)
    }

    /// Send `input` on the child's stdin and capture its stdout.
    ///
    /// Stdout is drained on a separate thread while this thread writes, so
    /// neither side can stall on a full pipe. A child that stops reading
    /// early (broken pipe) is judged by its exit status, not by the write.
    pub fn output_with_input(self, input: &[u8]) -> Result<Vec<u8>> {
        debug!(command = %self.describe(), bytes = input.len(), "running git with piped input");
        let mut guard = ChildGuard::spawn(
            self.command()
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit()),
        )?;

        let mut stdout = guard.child().stdout.take().expect("stdout was piped");
        let reader = thread::spawn(move || -> std::io::Result<Vec<u8>> {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf)?;
            Ok(buf)
        });

        {
            let mut stdin = guard.child().stdin.take().expect("stdin was piped");
            match stdin.write_all(input) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => return Err(GitCryptError::io_stream("writing", "git stdin", e)),
            }
            // Dropping stdin closes the pipe and lets the child finish.
        }

        let status = guard.wait()?;
        let data = match reader.join() {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => return Err(GitCryptError::io_stream("reading", "git stdout", e)),
            Err(_) => {
                return Err(GitCryptError::GitFailed {
                    command: self.describe(),
                    status: None,
                })
            }
        };
        self.ensure_success(status)?;
        Ok(data)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        cmd.args(&self.args);
        cmd
    }

    fn describe(&self) -> String {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn ensure_success(&self, status: ExitStatus) -> Result<()> {
        if status.success() {
            Ok(())
        } else {
            Err(GitCryptError::GitFailed {
                command: self.describe(),
                status: status.code(),
            })
        }
    }
}

/// Kills and reaps the child if the invocation is abandoned before `wait`,
/// so an early `?` return cannot leak a zombie holding our pipes.
struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    fn spawn(cmd: &mut Command) -> Result<Self> {
        let child = cmd
            .spawn()
            .map_err(|e| GitCryptError::io_stream("spawning", "git", e))?;
        Ok(Self { child: Some(child) })
    }

    fn child(&mut self) -> &mut Child {
        self.child.as_mut().expect("child not yet waited on")
    }

    fn wait(mut self) -> Result<ExitStatus> {
        let mut child = self.child.take().expect("child not yet waited on");
        child
            .wait()
            .map_err(|e| GitCryptError::io_stream("waiting for", "git", e))
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
