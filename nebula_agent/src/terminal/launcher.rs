//! Spawning a shell attached to a pseudo-terminal.

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{self, Read, Write};
use tracing::debug;

use crate::error::TerminalError;

/// Out-of-band control over a running shell.
pub trait ShellControl: Send {
    fn resize(&mut self, cols: u16, rows: u16) -> io::Result<()>;

    /// Terminate the process and release the terminal device.
    fn kill(&mut self) -> io::Result<()>;

    fn process_id(&self) -> Option<u32> {
        None
    }
}

/// The three halves of a freshly started shell.
///
/// `reader` and `writer` may fail with `TimedOut` or `WouldBlock` when no
/// progress was possible for a short while; callers retry unless the session
/// was closed in the meantime.
pub struct SpawnedShell {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: Box<dyn ShellControl>,
}

pub trait ShellLauncher: Send + Sync {
    fn spawn(&self, shell: &str, cols: u16, rows: u16) -> Result<SpawnedShell, TerminalError>;
}

/// Launches shells on the host's native PTY implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtyLauncher;

impl ShellLauncher for PtyLauncher {
    fn spawn(&self, shell: &str, cols: u16, rows: u16) -> Result<SpawnedShell, TerminalError> {
        let spawn_err = |e: anyhow::Error| TerminalError::SpawnFailed(format!("{shell}: {e:#}"));

        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(spawn_err)?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", "xterm-256color");
        #[cfg(windows)]
        if crate::terminal::shell::base_name(shell).eq_ignore_ascii_case("powershell") {
            cmd.args(["-NoLogo", "-NoProfile"]);
        }

        let child = pair.slave.spawn_command(cmd).map_err(spawn_err)?;
        // keep only the master side open so a child exit surfaces as end-of-stream
        drop(pair.slave);

        let (reader, writer) = pty_streams(pair.master.as_ref()).map_err(spawn_err)?;
        debug!(shell, pid = ?child.process_id(), "shell spawned");

        Ok(SpawnedShell {
            reader,
            writer,
            control: Box::new(PtyControl {
                master: Some(pair.master),
                child,
            }),
        })
    }
}

#[cfg(unix)]
fn pty_streams(master: &dyn MasterPty) -> anyhow::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
    let fd = master
        .as_raw_fd()
        .ok_or_else(|| anyhow::anyhow!("pty master has no descriptor"))?;
    let reader = polled::PolledFd::dup(fd)?;
    let writer = reader.try_clone()?;
    Ok((Box::new(reader), Box::new(writer)))
}

#[cfg(not(unix))]
fn pty_streams(master: &dyn MasterPty) -> anyhow::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
    Ok((master.try_clone_reader()?, master.take_writer()?))
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

struct PtyControl {
    master: Option<Box<dyn MasterPty + Send>>,
    child: Box<dyn Child + Send + Sync>,
}

impl ShellControl for PtyControl {
    fn resize(&mut self, cols: u16, rows: u16) -> io::Result<()> {
        let Some(master) = self.master.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "pty released"));
        };
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    fn kill(&mut self) -> io::Result<()> {
        // an already exited child reports an error here; reaping below still applies
        let killed = self.force_kill();
        if let Err(e) = self.child.wait() {
            debug!("waiting for shell: {e}");
        }
        self.master.take();
        killed
    }

    fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }
}

impl PtyControl {
    /// SIGKILL the shell's process group without a grace period.
    #[cfg(unix)]
    fn force_kill(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.process_id() else {
            return self.child.kill();
        };
        let pid = pid as libc::pid_t;
        // the shell leads its own session, so its pid names its process group
        // SAFETY: plain signal delivery, no memory is shared with the callee
        if unsafe { libc::killpg(pid, libc::SIGKILL) } == 0 {
            return Ok(());
        }
        // SAFETY: as above
        if unsafe { libc::kill(pid, libc::SIGKILL) } == 0 {
            return Ok(());
        }
        Err(io::Error::last_os_error())
    }

    #[cfg(not(unix))]
    fn force_kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}

/// Non-blocking master descriptor whose reads and writes give up after a
/// short poll so a closed session never leaves a thread parked in the kernel.
#[cfg(unix)]
mod polled {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

    const POLL_SLICE_MS: libc::c_int = 100;

    pub struct PolledFd {
        file: File,
    }

    impl PolledFd {
        /// Duplicate `fd` (close-on-exec) and switch the open file to non-blocking.
        pub fn dup(fd: RawFd) -> io::Result<Self> {
            // SAFETY: `fd` belongs to a master that outlives this call
            let owned = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;
            let file = File::from(owned);
            set_nonblocking(file.as_raw_fd())?;
            Ok(Self { file })
        }

        pub fn try_clone(&self) -> io::Result<Self> {
            Ok(Self {
                file: self.file.try_clone()?,
            })
        }

        fn wait(&self, events: libc::c_short) -> io::Result<()> {
            let mut pfd = libc::pollfd {
                fd: self.file.as_raw_fd(),
                events,
                revents: 0,
            };
            // SAFETY: one valid pollfd for the duration of the call
            match unsafe { libc::poll(&mut pfd, 1, POLL_SLICE_MS) } {
                -1 => Err(io::Error::last_os_error()),
                0 => Err(io::ErrorKind::TimedOut.into()),
                _ => Ok(()),
            }
        }
    }

    fn set_nonblocking(fd: RawFd) -> io::Result<()> {
        // SAFETY: fcntl on a descriptor we own
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    impl Read for PolledFd {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            // hang-up also wakes poll; the read then reports EIO
            self.wait(libc::POLLIN)?;
            self.file.read(buf)
        }
    }

    impl Write for PolledFd {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.wait(libc::POLLOUT)?;
            self.file.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
