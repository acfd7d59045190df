use std::io;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use culvert_core::{BufferConfig, BufferPool, MasterPool, ShiftBuf};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::worker::{Event, WorkerCtx, WorkerHandle};

/// Invoked on the destination worker thread for every packet read from the
/// device
pub type TunReadCallback = Box<dyn Fn(&WorkerCtx, &Arc<TunDevice>, ShiftBuf) + Send + Sync>;

/// Bounded depth of the writer queue; a full queue fails the write rather
/// than blocking the caller
const WRITE_QUEUE_DEPTH: usize = 256;

/// Poll granularity of the reader thread, which is how fast it notices a
/// bring-down
const READ_POLL_MILLIS: i32 = 250;

/// A Linux TUN device bridged into the engine
///
/// Two dedicated OS threads run while the device is up: the reader pulls one
/// packet per pooled buffer and round-robins it across the workers through
/// their event channels; the writer drains a bounded queue fed by
/// [`write`](TunDevice::write). Blocking stays confined to these threads —
/// workers only ever see packets as posted events.
pub struct TunDevice {
    name: String,
    fd: OwnedFd,
    running: AtomicBool,
    up: AtomicBool,
    callback: TunReadCallback,
    workers: Vec<WorkerHandle>,
    masters: (Arc<MasterPool<ShiftBuf>>, Arc<MasterPool<ShiftBuf>>),
    buffers: BufferConfig,
    writer: Mutex<Option<SyncSender<ShiftBuf>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TunDevice {
    pub(crate) fn create(
        name: &str,
        offload: bool,
        workers: Vec<WorkerHandle>,
        masters: (Arc<MasterPool<ShiftBuf>>, Arc<MasterPool<ShiftBuf>>),
        buffers: BufferConfig,
        callback: TunReadCallback,
    ) -> Result<Arc<Self>, TunError> {
        // TODO: negotiate TUNSETOFFLOAD when offload is requested
        let _ = offload;
        let (fd, name) = open_device(name)?;
        debug!(dev = %name, "device created");
        Ok(Arc::new(Self {
            name,
            fd,
            running: AtomicBool::new(false),
            up: AtomicBool::new(false),
            callback,
            workers,
            masters,
            buffers,
            writer: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        }))
    }

    /// The interface name, as the kernel finalized it
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a packet for the device; never blocks
    ///
    /// The buffer comes back inside the error so the caller can recycle it
    /// and decide whether dropping was acceptable.
    pub fn write(&self, buf: ShiftBuf) -> Result<(), TunWriteError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(TunWriteError::NotRunning(buf));
        }
        let sender = self.writer.lock().unwrap();
        let Some(tx) = sender.as_ref() else {
            return Err(TunWriteError::Closed(buf));
        };
        match tx.try_send(buf) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(buf)) => {
                warn!(dev = %self.name, "write failed, queue is full");
                Err(TunWriteError::Full(buf))
            }
            Err(TrySendError::Disconnected(buf)) => {
                warn!(dev = %self.name, "write failed, queue was closed");
                Err(TunWriteError::Closed(buf))
            }
        }
    }

    /// Add an address to the interface (shells out to `ip(8)`)
    pub fn assign_ip(&self, ip: IpAddr, prefix: u8) -> Result<(), TunError> {
        self.ip_command(&["addr", "add", &format!("{ip}/{prefix}"), "dev", &self.name])?;
        debug!(dev = %self.name, %ip, prefix, "address assigned");
        Ok(())
    }

    /// Remove an address from the interface
    pub fn unassign_ip(&self, ip: IpAddr, prefix: u8) -> Result<(), TunError> {
        self.ip_command(&["addr", "del", &format!("{ip}/{prefix}"), "dev", &self.name])?;
        debug!(dev = %self.name, %ip, prefix, "address removed");
        Ok(())
    }

    /// Open the write queue, bring the link up, and start both threads
    pub fn bring_up(self: &Arc<Self>) -> Result<(), TunError> {
        if self.up.swap(true, Ordering::SeqCst) {
            return Err(TunError::AlreadyUp);
        }
        self.running.store(true, Ordering::SeqCst);
        let (tx, rx) = std::sync::mpsc::sync_channel(WRITE_QUEUE_DEPTH);
        *self.writer.lock().unwrap() = Some(tx);

        if let Err(err) = self.ip_command(&["link", "set", "dev", &self.name, "up"]) {
            self.running.store(false, Ordering::SeqCst);
            self.up.store(false, Ordering::SeqCst);
            self.writer.lock().unwrap().take();
            return Err(err);
        }

        let reader = {
            let dev = self.clone();
            std::thread::Builder::new()
                .name(format!("culvert-tun-read-{}", self.name))
                .spawn(move || dev.reader_main())
                .expect("failed to spawn TUN reader thread")
        };
        let writer = {
            let dev = self.clone();
            std::thread::Builder::new()
                .name(format!("culvert-tun-write-{}", self.name))
                .spawn(move || dev.writer_main(rx))
                .expect("failed to spawn TUN writer thread")
        };
        self.threads.lock().unwrap().extend([reader, writer]);
        debug!(dev = %self.name, "device is up");
        Ok(())
    }

    /// Flip the running flag, close the write queue (unblocking the writer,
    /// which recycles whatever is left), bring the link down, join both
    /// threads
    pub fn bring_down(&self) -> Result<(), TunError> {
        if !self.up.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.running.store(false, Ordering::SeqCst);
        self.writer.lock().unwrap().take();
        let result = self.ip_command(&["link", "set", "dev", &self.name, "down"]);
        for join in self.threads.lock().unwrap().drain(..) {
            let _ = join.join();
        }
        debug!(dev = %self.name, "device is down");
        result
    }

    pub(crate) fn dispatch(self: &Arc<Self>, ctx: &WorkerCtx, buf: ShiftBuf) {
        (self.callback)(ctx, self, buf);
    }

    /// Reader thread: one packet per pooled buffer, fanned out round-robin
    fn reader_main(self: Arc<Self>) {
        let mut pool = BufferPool::new(self.masters.0.clone(), self.masters.1.clone(), &self.buffers);
        let mut target = 0usize;
        while self.running.load(Ordering::Relaxed) {
            match self.wait_readable() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    error!(dev = %self.name, %err, "poll failed, exiting read thread");
                    return;
                }
            }
            let mut buf = pool.get_small();
            let spare = buf.unwritten_mut();
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    spare.as_mut_ptr().cast(),
                    spare.len(),
                )
            };
            if n == 0 {
                pool.reuse(buf);
                warn!(dev = %self.name, "exiting read thread on end of file");
                return;
            }
            if n < 0 {
                pool.reuse(buf);
                let err = io::Error::last_os_error();
                if is_transient(&err) {
                    continue;
                }
                error!(dev = %self.name, %err, "exiting read thread on fatal read error");
                return;
            }
            buf.add_len(n as usize);
            trace!(dev = %self.name, bytes = n, "read packet");

            let event = Event::TunPacket {
                dev: self.clone(),
                buf,
            };
            if let Err(Event::TunPacket { buf, .. }) = self.workers[target].post(event) {
                pool.reuse(buf);
            }
            target += 1;
            if target >= self.workers.len() {
                target = 0;
            }
        }
    }

    /// Writer thread: drains the bounded queue into the device
    fn writer_main(self: Arc<Self>, packets: Receiver<ShiftBuf>) {
        let mut pool = BufferPool::new(self.masters.0.clone(), self.masters.1.clone(), &self.buffers);
        for buf in packets.iter() {
            if !self.running.load(Ordering::Relaxed) {
                // bring-down in progress: recycle instead of writing
                pool.reuse(buf);
                continue;
            }
            loop {
                let n = unsafe {
                    libc::write(
                        self.fd.as_raw_fd(),
                        buf.as_slice().as_ptr().cast(),
                        buf.len(),
                    )
                };
                if n == 0 {
                    pool.reuse(buf);
                    warn!(dev = %self.name, "exiting write thread on end of file");
                    return;
                }
                if n < 0 {
                    let err = io::Error::last_os_error();
                    if is_transient(&err) {
                        continue;
                    }
                    pool.reuse(buf);
                    error!(dev = %self.name, %err, "exiting write thread on fatal write error");
                    return;
                }
                break;
            }
            pool.reuse(buf);
        }
        debug!(dev = %self.name, "exiting write thread, queue closed");
    }

    /// Bounded wait for read readiness so the thread notices bring-down
    fn wait_readable(&self) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, READ_POLL_MILLIS) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if is_transient(&err) {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(rc > 0)
    }

    fn ip_command(&self, args: &[&str]) -> Result<(), TunError> {
        let status = Command::new("ip")
            .args(args)
            .status()
            .map_err(TunError::Command)?;
        if !status.success() {
            return Err(TunError::CommandFailed(format!("ip {}", args.join(" "))));
        }
        Ok(())
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        if self.up.load(Ordering::SeqCst) {
            let _ = self.bring_down();
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINVAL)
    )
}

#[cfg(target_os = "linux")]
fn open_device(name: &str) -> Result<(OwnedFd, String), TunError> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")
        .map_err(TunError::Open)?;
    let fd: OwnedFd = file.into();

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;
    if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TUNSETIFF, &ifr) } < 0 {
        return Err(TunError::Ioctl(io::Error::last_os_error()));
    }

    // the kernel fills in the final name for templates like "tun%d"
    let len = ifr
        .ifr_name
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(ifr.ifr_name.len());
    let name = ifr.ifr_name[..len].iter().map(|&c| c as u8 as char).collect();
    Ok((fd, name))
}

#[cfg(not(target_os = "linux"))]
fn open_device(_name: &str) -> Result<(OwnedFd, String), TunError> {
    Err(TunError::Unsupported)
}

/// The device could not be created or reconfigured
#[derive(Debug, Error)]
pub enum TunError {
    /// Only Linux TUN devices are implemented
    #[error("TUN devices are not supported on this platform")]
    Unsupported,
    /// `/dev/net/tun` could not be opened
    #[error("failed to open the TUN control device: {0}")]
    Open(io::Error),
    /// The interface could not be claimed
    #[error("TUNSETIFF failed: {0}")]
    Ioctl(io::Error),
    /// `ip(8)` could not be spawned
    #[error("failed to run ip(8): {0}")]
    Command(io::Error),
    /// `ip(8)` reported failure
    #[error("`{0}` exited with failure")]
    CommandFailed(String),
    /// The device is already up
    #[error("device is already up")]
    AlreadyUp,
}

/// A packet could not be queued for the device
///
/// The rejected buffer rides along so the caller can recycle it.
#[derive(Debug, Error)]
pub enum TunWriteError {
    /// The device is not running
    #[error("device is not running")]
    NotRunning(ShiftBuf),
    /// The bounded queue is full; the caller decides whether to drop
    #[error("write queue is full")]
    Full(ShiftBuf),
    /// The queue closed underneath the caller
    #[error("write queue is closed")]
    Closed(ShiftBuf),
}

impl TunWriteError {
    /// Recover the buffer for recycling
    pub fn into_buffer(self) -> ShiftBuf {
        match self {
            Self::NotRunning(buf) | Self::Full(buf) | Self::Closed(buf) => buf,
        }
    }
}
