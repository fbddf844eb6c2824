//! A single shell running on a PTY.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::{self, Read, Write};
use tracing::{debug, info};

use super::launcher::{ShellControl, SpawnedShell};
use crate::error::TerminalError;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub shell: String,
    pub created_at: DateTime<Utc>,
    pub pid: Option<u32>,
}

/// Reads and writes go through separate locks so a pending read never stalls
/// input. `closed` is checked before any I/O, between every retry of a stalled
/// read or write, and set once by `close`.
pub struct Session {
    id: String,
    shell: String,
    created_at: DateTime<Utc>,
    pid: Option<u32>,
    closed: Mutex<bool>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    control: Mutex<Option<Box<dyn ShellControl>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("shell", &self.shell)
            .field("created_at", &self.created_at)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(id: impl Into<String>, shell: impl Into<String>, spawned: SpawnedShell) -> Self {
        let SpawnedShell {
            reader,
            writer,
            control,
        } = spawned;
        Self {
            id: id.into(),
            shell: shell.into(),
            created_at: Utc::now(),
            pid: control.process_id(),
            closed: Mutex::new(false),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            control: Mutex::new(Some(control)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            shell: self.shell.clone(),
            created_at: self.created_at,
            pid: self.pid,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Blocking read of shell output. `Ok(0)` is end-of-stream: the shell exited
    /// or the session was closed while the read was in flight.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, TerminalError> {
        if self.is_closed() {
            return Err(TerminalError::SessionClosed(self.id.clone()));
        }
        let mut reader = self.reader.lock();
        let Some(r) = reader.as_mut() else {
            return Err(TerminalError::SessionClosed(self.id.clone()));
        };
        loop {
            match r.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if is_stall(&e) => {
                    if self.is_closed() {
                        return Ok(0);
                    }
                }
                // Linux reports EIO on the master once the slave side is gone
                Err(e) if is_hangup(&e) || self.is_closed() => {
                    debug!(session = %self.id, "pty read ended: {e}");
                    return Ok(0);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Forward input to the shell. Everything is written or an error is returned.
    pub fn write(&self, data: &[u8]) -> Result<usize, TerminalError> {
        if self.is_closed() {
            return Err(TerminalError::SessionClosed(self.id.clone()));
        }
        let mut writer = self.writer.lock();
        let Some(w) = writer.as_mut() else {
            return Err(TerminalError::SessionClosed(self.id.clone()));
        };
        let mut rest = data;
        while !rest.is_empty() {
            match w.write(rest) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => rest = &rest[n..],
                Err(e) if is_stall(&e) => {
                    if self.is_closed() {
                        return Err(TerminalError::SessionClosed(self.id.clone()));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        w.flush()?;
        Ok(data.len())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), TerminalError> {
        if self.is_closed() {
            return Err(TerminalError::SessionClosed(self.id.clone()));
        }
        match self.control.lock().as_mut() {
            Some(c) => Ok(c.resize(cols, rows)?),
            None => Err(TerminalError::SessionClosed(self.id.clone())),
        }
    }

    /// Terminate the shell and release the PTY. Returns false if already closed.
    pub fn close(&self) -> bool {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return false;
            }
            *closed = true;
        }
        if let Some(mut control) = self.control.lock().take() {
            if let Err(e) = control.kill() {
                debug!(session = %self.id, "kill: {e}");
            }
        }
        // a reader or writer stuck on a full PTY holds its lock; it notices the
        // flag within one poll slice and the handle goes with the session
        if let Some(mut w) = self.writer.try_lock() {
            w.take();
        }
        if let Some(mut r) = self.reader.try_lock() {
            r.take();
        }
        info!(session = %self.id, shell = %self.shell, "terminal session closed");
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_stall(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn is_hangup(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EIO) {
        return true;
    }
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    /// In-memory shell: scripted output, captured input.
    #[derive(Clone, Default)]
    pub(crate) struct FakeShell {
        pub output: Arc<Mutex<VecDeque<Vec<u8>>>>,
        pub input: Arc<Mutex<Vec<u8>>>,
        pub killed: Arc<AtomicBool>,
        pub resizes: Arc<AtomicUsize>,
    }

    impl FakeShell {
        pub fn spawned(&self) -> SpawnedShell {
            SpawnedShell {
                reader: Box::new(FakeReader(self.output.clone())),
                writer: Box::new(FakeWriter(self.input.clone())),
                control: Box::new(self.clone()),
            }
        }
    }

    struct FakeReader(Arc<Mutex<VecDeque<Vec<u8>>>>);
    struct FakeWriter(Arc<Mutex<Vec<u8>>>);

    impl Read for FakeReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.lock().pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }
    }

    impl Write for FakeWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ShellControl for FakeShell {
        fn resize(&mut self, _cols: u16, _rows: u16) -> io::Result<()> {
            self.resizes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn kill(&mut self) -> io::Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn io_passes_through_until_closed() {
        let shell = FakeShell::default();
        shell.output.lock().push_back(b"hello".to_vec());
        let s = Session::new("s1", "sh", shell.spawned());

        let mut buf = [0u8; 16];
        assert_eq!(s.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(s.write(b"ls\n").unwrap(), 3);
        assert_eq!(shell.input.lock().as_slice(), b"ls\n");
        s.resize(120, 40).unwrap();
        assert_eq!(shell.resizes.load(Ordering::SeqCst), 1);

        assert!(s.close());
        assert!(shell.killed.load(Ordering::SeqCst));
        assert!(matches!(s.write(b"x"), Err(TerminalError::SessionClosed(_))));
        assert!(matches!(s.read(&mut buf), Err(TerminalError::SessionClosed(_))));
        assert!(matches!(s.resize(1, 1), Err(TerminalError::SessionClosed(_))));
    }

    #[test]
    fn close_is_idempotent() {
        let s = Session::new("s1", "sh", FakeShell::default().spawned());
        assert!(s.close());
        assert!(!s.close());
        assert!(s.is_closed());
    }

    /// Never makes progress, like a PTY whose other side went quiet.
    struct Stalled;

    impl Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(std::time::Duration::from_millis(5));
            Err(io::ErrorKind::TimedOut.into())
        }
    }

    impl Write for Stalled {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            std::thread::sleep(std::time::Duration::from_millis(5));
            Err(io::ErrorKind::WouldBlock.into())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn close_releases_stalled_reader_and_writer() {
        let shell = FakeShell::default();
        let mut spawned = shell.spawned();
        spawned.reader = Box::new(Stalled);
        spawned.writer = Box::new(Stalled);
        let s = Arc::new(Session::new("s1", "sh", spawned));

        let reading = {
            let s = s.clone();
            std::thread::spawn(move || s.read(&mut [0u8; 8]))
        };
        let writing = {
            let s = s.clone();
            std::thread::spawn(move || s.write(b"never drained"))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(s.close());

        assert_eq!(reading.join().unwrap().unwrap(), 0);
        assert!(matches!(writing.join().unwrap(), Err(TerminalError::SessionClosed(_))));
        assert!(shell.killed.load(Ordering::SeqCst));
    }
}
