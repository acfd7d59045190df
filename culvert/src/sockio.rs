use std::cell::Cell;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use culvert_core::{BufferPool, BufferQueue, ShiftBuf};
use tokio::net::TcpStream;
use tokio::sync::Notify;

/// Keep-alive window granted to a fresh inbound connection until the chain
/// reports established
pub(crate) const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(75);

/// Inactivity window for established lines
pub(crate) const ESTABLISHED_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Inactivity window on outbound connections
pub(crate) const READ_WRITE_TIMEOUT: Duration = Duration::from_secs(300);

/// Why a readiness wait returned
pub(crate) enum IoWait {
    /// The socket is ready
    Ready,
    /// Woken by pause/resume/close bookkeeping; re-check flags
    Woken,
    /// Nothing happened within the idle window
    IdleExpired,
    /// The socket reported an error
    Failed(io::Error),
}

/// Result of a non-blocking read attempt
pub(crate) enum ReadOutcome {
    /// Bytes were appended to the buffer
    Data(usize),
    /// Peer closed its end
    Eof,
    /// Spurious readiness; try again
    Retry,
}

/// Per-line socket state shared between synchronous chain handlers and the
/// line's read/write tasks
///
/// Everything here is single-threaded: handlers and tasks interleave only at
/// await points, which is what makes the plain `Cell` flags sound. Closing
/// cancels all pending interest — both tasks observe the flag at their next
/// wakeup and exit, and the descriptor closes when the last `Rc` drops.
pub(crate) struct LineIo {
    stream: TcpStream,
    read_paused: Cell<bool>,
    closed: Cell<bool>,
    read_wake: Notify,
    write_wake: Notify,
    last_activity: Cell<Instant>,
    idle_timeout: Cell<Duration>,
}

impl LineIo {
    pub(crate) fn new(stream: TcpStream, idle_timeout: Duration) -> Rc<Self> {
        Rc::new(Self {
            stream,
            read_paused: Cell::new(false),
            closed: Cell::new(false),
            read_wake: Notify::new(),
            write_wake: Notify::new(),
            last_activity: Cell::new(Instant::now()),
            idle_timeout: Cell::new(idle_timeout),
        })
    }

    /// Record activity, pushing the idle deadline out
    pub(crate) fn touch(&self) {
        self.last_activity.set(Instant::now());
    }

    pub(crate) fn set_idle_timeout(&self, timeout: Duration) {
        self.idle_timeout.set(timeout);
        self.touch();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Cancel all pending interest; idempotent
    pub(crate) fn close(&self) {
        if !self.closed.replace(true) {
            self.read_wake.notify_waiters();
            self.write_wake.notify_waiters();
        }
    }

    pub(crate) fn reads_paused(&self) -> bool {
        self.read_paused.get()
    }

    pub(crate) fn pause_reads(&self) {
        self.read_paused.set(true);
    }

    pub(crate) fn resume_reads(&self) {
        self.read_paused.set(false);
        self.read_wake.notify_waiters();
    }

    fn idle_deadline(&self) -> tokio::time::Instant {
        tokio::time::Instant::from_std(self.last_activity.get() + self.idle_timeout.get())
    }

    /// Wait for read readiness, a wake, or idle expiry
    pub(crate) async fn wait_readable(&self) -> IoWait {
        tokio::select! {
            _ = self.read_wake.notified() => IoWait::Woken,
            ready = tokio::time::timeout_at(self.idle_deadline(), self.stream.readable()) => {
                match ready {
                    Ok(Ok(())) => IoWait::Ready,
                    Ok(Err(err)) => IoWait::Failed(err),
                    Err(_) => IoWait::IdleExpired,
                }
            }
        }
    }

    /// Wait while reads are paused
    pub(crate) async fn wait_read_wake(&self) -> IoWait {
        match tokio::time::timeout_at(self.idle_deadline(), self.read_wake.notified()).await {
            Ok(()) => IoWait::Woken,
            Err(_) => IoWait::IdleExpired,
        }
    }

    /// Wait for write readiness, a wake, or idle expiry
    pub(crate) async fn wait_writable(&self) -> IoWait {
        tokio::select! {
            _ = self.write_wake.notified() => IoWait::Woken,
            ready = tokio::time::timeout_at(self.idle_deadline(), self.stream.writable()) => {
                match ready {
                    Ok(Ok(())) => IoWait::Ready,
                    Ok(Err(err)) => IoWait::Failed(err),
                    Err(_) => IoWait::IdleExpired,
                }
            }
        }
    }

    /// Append what the socket will take right now into `buf`
    pub(crate) fn try_read_into(&self, buf: &mut ShiftBuf) -> io::Result<ReadOutcome> {
        match self.stream.try_read(buf.unwritten_mut()) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => {
                buf.add_len(n);
                self.touch();
                Ok(ReadOutcome::Data(n))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::Retry),
            Err(err) => Err(err),
        }
    }

    /// Write what the socket will take right now; `Ok(0)` means it took
    /// nothing
    pub(crate) fn write_some(&self, data: &[u8]) -> io::Result<usize> {
        match self.stream.try_write(data) {
            Ok(n) => {
                self.touch();
                Ok(n)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Write `buf` or park whatever the socket refused
    ///
    /// Parks the whole buffer when the queue is non-empty, preserving order
    /// behind an already-pending write. `Ok(true)` means fully written.
    pub(crate) fn write_or_park(
        &self,
        buf: ShiftBuf,
        queue: &mut BufferQueue,
        pool: &mut BufferPool,
    ) -> io::Result<bool> {
        if !queue.is_empty() {
            queue.push_back(buf);
            return Ok(false);
        }
        match self.write_some(buf.as_slice()) {
            Ok(n) if n == buf.len() => {
                pool.reuse(buf);
                Ok(true)
            }
            Ok(n) => {
                let mut rest = buf;
                rest.consume(n);
                queue.push_back(rest);
                Ok(false)
            }
            Err(err) => {
                pool.reuse(buf);
                Err(err)
            }
        }
    }

    /// Flush parked writes in FIFO order; `Ok(true)` means the queue drained
    pub(crate) fn flush_queue(
        &self,
        queue: &mut BufferQueue,
        pool: &mut BufferPool,
    ) -> io::Result<bool> {
        while let Some(mut buf) = queue.pop_front() {
            match self.write_some(buf.as_slice()) {
                Ok(n) if n == buf.len() => pool.reuse(buf),
                Ok(n) => {
                    buf.consume(n);
                    queue.push_front(buf);
                    return Ok(false);
                }
                Err(err) => {
                    pool.reuse(buf);
                    return Err(err);
                }
            }
        }
        Ok(true)
    }
}
