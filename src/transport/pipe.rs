//! Pool of kernel pipes used for zero-copy relay
//!
//! Every relay moves bytes socket -> pipe -> socket with `splice(2)`, so the
//! payload never enters user space. Pipes are created once and borrowed for
//! the duration of a single relay; waiting for a free pipe is an async wait
//! bounded by the pool size.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use nix::fcntl::{splice, OFlag, SpliceFFlags};
use nix::unistd::pipe2;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::metrics::metrics;

/// Upper bound for one splice call
pub const SPLICE_MAX_BYTES: usize = 65535;
/// Pipes created when the configuration does not say otherwise
pub const DEFAULT_POOL_SIZE: usize = 32;

/// A kernel pipe (read end, write end)
#[derive(Debug)]
pub struct Pipe {
    read: File,
    write: File,
}

impl Pipe {
    fn open() -> io::Result<Self> {
        let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(Self {
            read: File::from(read),
            write: File::from(write),
        })
    }

    /// Splice up to `len` bytes from `src` into the pipe
    pub fn fill_from<F: AsFd>(&self, src: F, len: usize) -> io::Result<usize> {
        let flags = SpliceFFlags::SPLICE_F_MOVE | SpliceFFlags::SPLICE_F_NONBLOCK;
        Ok(splice(src, None, &self.write, None, len, flags)?)
    }

    /// Splice up to `len` buffered bytes from the pipe into `dst`
    pub fn drain_into<F: AsFd>(&self, dst: F, len: usize) -> io::Result<usize> {
        let flags = SpliceFFlags::SPLICE_F_MOVE | SpliceFFlags::SPLICE_F_NONBLOCK;
        Ok(splice(&self.read, None, dst, None, len, flags)?)
    }

    /// Read buffered bytes into user space
    pub fn read_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.read).read(buf)
    }

    /// Throw away whatever is left in the pipe
    fn discard_contents(&self) -> usize {
        let mut scratch = [0u8; 4096];
        let mut total = 0;
        loop {
            match self.read_into(&mut scratch) {
                Ok(0) => return total,
                Ok(n) => total += n,
                Err(_) => return total,
            }
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    in_use: bool,
    owner: Option<ThreadId>,
}

/// Fixed-size pool of pipes shared by every session
#[derive(Debug)]
pub struct PipePool {
    pipes: Vec<Pipe>,
    slots: Mutex<Vec<SlotState>>,
    available: Semaphore,
    waits: AtomicU64,
}

impl PipePool {
    /// Create `size` pipes up front
    pub fn new(size: usize) -> io::Result<Self> {
        let pipes = (0..size).map(|_| Pipe::open()).collect::<io::Result<Vec<_>>>()?;
        debug!(size = size, "Pipe pool created");
        Ok(Self {
            slots: Mutex::new((0..size).map(|_| SlotState::default()).collect()),
            available: Semaphore::new(size),
            pipes,
            waits: AtomicU64::new(0),
        })
    }

    /// Borrow a free pipe, waiting until one is returned if all are in use
    pub async fn acquire(&self) -> io::Result<PipeGuard<'_>> {
        let permit = match self.available.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                self.waits.fetch_add(1, Ordering::Relaxed);
                metrics().pipe_waits_total.inc();
                self.available
                    .acquire()
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe pool closed"))?
            }
        };

        let index = {
            let mut slots = self.slots.lock();
            let index = slots
                .iter()
                .position(|s| !s.in_use)
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "pipe pool bookkeeping out of sync"))?;
            slots[index].in_use = true;
            slots[index].owner = Some(thread::current().id());
            index
        };

        Ok(PipeGuard {
            pool: self,
            index,
            buffered: 0,
            _permit: permit,
        })
    }

    fn release(&self, index: usize, buffered: usize) {
        if buffered > 0 {
            let dropped = self.pipes[index].discard_contents();
            warn!(pipe = index, bytes = dropped, "Pipe returned with unsent data");
        }
        let mut slots = self.slots.lock();
        slots[index].in_use = false;
        slots[index].owner = None;
    }

    /// Stop handing out pipes; pending and future acquires fail
    pub fn close(&self) {
        self.available.close();
    }

    pub fn capacity(&self) -> usize {
        self.pipes.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.in_use).count()
    }

    /// Thread that borrowed pipe `index`, if it is in use
    pub fn owner_of(&self, index: usize) -> Option<ThreadId> {
        self.slots.lock().get(index).and_then(|s| s.owner)
    }

    /// Number of acquires that had to wait for a pipe
    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }
}

/// A borrowed pipe, returned to the pool on drop
pub struct PipeGuard<'a> {
    pool: &'a PipePool,
    index: usize,
    /// Bytes spliced in but not yet spliced out
    buffered: usize,
    _permit: SemaphorePermit<'a>,
}

impl PipeGuard<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn fill_from<F: AsFd>(&mut self, src: F, len: usize) -> io::Result<usize> {
        let n = self.pool.pipes[self.index].fill_from(src, len)?;
        self.buffered += n;
        Ok(n)
    }

    pub fn drain_into<F: AsFd>(&mut self, dst: F) -> io::Result<usize> {
        let n = self.pool.pipes[self.index].drain_into(dst, self.buffered)?;
        self.buffered -= n;
        Ok(n)
    }

    /// Move up to `buf.len()` buffered bytes into user space
    pub fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(self.buffered);
        let n = self.pool.pipes[self.index].read_into(&mut buf[..len])?;
        self.buffered -= n;
        Ok(n)
    }
}

impl Drop for PipeGuard<'_> {
    fn drop(&mut self) {
        self.pool.release(self.index, self.buffered);
    }
}
