//! AF_PACKET capture session: socket, interface binding and the mapped ring.

use std::{
    ffi::CString,
    future, io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{Interest, unix::AsyncFd},
    sync::watch,
    time::{self, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    error::CaptureError,
    ring::{Block, PacketRing, RingGeometry},
};

// Not every libc release exports these; values from <linux/if_packet.h>.
const PACKET_ADD_MEMBERSHIP: libc::c_int = 1;
const PACKET_MR_PROMISC: libc::c_ushort = 1;
const PACKET_STATISTICS: libc::c_int = 6;
const PACKET_IGNORE_OUTGOING: libc::c_int = 23;

#[repr(C)]
struct PacketMreq {
    mr_ifindex: libc::c_int,
    mr_type: libc::c_ushort,
    mr_alen: libc::c_ushort,
    mr_address: [u8; 8],
}

#[repr(C)]
#[derive(Default)]
struct TpacketStatsV3 {
    tp_packets: libc::c_uint,
    tp_drops: libc::c_uint,
    tp_freeze_q_cnt: libc::c_uint,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SessionOptions {
    /// Put the interface into promiscuous mode for the life of the socket.
    pub promiscuous: bool,
}

/// Outcome of waiting for the next retired block.
pub enum NextBlock<'a> {
    Ready(Block<'a>),
    Timeout,
    Closed,
}

/// Kernel-side socket counters, accumulated across reads.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct KernelStats {
    pub packets: u64,
    pub drops: u64,
    pub freezes: u64,
}

/// Stops a running session from any task. Cloning is cheap.
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

pub(crate) enum Wake {
    Readable,
    Timeout,
    Stopped,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Running,
    Closed,
}

pub struct CaptureSession {
    // Dropped before `fd`, so the region is unmapped while the socket is open.
    ring: PacketRing,
    fd: AsyncFd<OwnedFd>,
    interface: String,
    ifindex: u32,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    state: State,
    kernel: KernelStats,
}

impl CaptureSession {
    /// Open a TPACKET_V3 capture on `interface`.
    ///
    /// Must be called from within a tokio runtime. Every failure returns
    /// before anything is left open.
    pub fn open(
        interface: &str,
        geometry: &RingGeometry,
        options: &SessionOptions,
    ) -> Result<Self, CaptureError> {
        geometry.validate()?;

        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(CaptureError::socket(interface, "socket", io::Error::last_os_error()));
        }
        let owned_fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let ifindex = interface_index(interface)?;

        let version: libc::c_int = libc::tpacket_versions::TPACKET_V3 as libc::c_int;
        setsockopt(owned_fd.as_raw_fd(), libc::SOL_PACKET, libc::PACKET_VERSION, &version)
            .map_err(|err| CaptureError::socket(interface, "PACKET_VERSION", err))?;

        bind_interface(owned_fd.as_raw_fd(), ifindex, protocol)
            .map_err(|err| CaptureError::socket(interface, "bind", err))?;

        // Pre-4.20 kernels lack this; outgoing frames are then dropped by
        // their sll_pkttype while reading.
        let ignore: libc::c_int = 1;
        if let Err(err) = setsockopt(owned_fd.as_raw_fd(), libc::SOL_PACKET, PACKET_IGNORE_OUTGOING, &ignore) {
            warn!(%interface, error = %err, "kernel does not support PACKET_IGNORE_OUTGOING");
        }

        if options.promiscuous {
            if let Err(err) = enable_promiscuous(owned_fd.as_raw_fd(), ifindex) {
                warn!(%interface, error = %err, "failed to enable promiscuous mode, continuing without it");
            }
        }

        let ring = PacketRing::map(owned_fd.as_raw_fd(), *geometry, interface)?;

        let fd = AsyncFd::with_interest(owned_fd, Interest::READABLE)
            .map_err(|err| CaptureError::socket(interface, "register", err))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        info!(
            %interface,
            ifindex,
            block_size = geometry.block_size,
            blocks = geometry.block_count(),
            frame_size = geometry.frame_size,
            retire_timeout_ms = geometry.retire_timeout_ms,
            "capture session open"
        );

        Ok(Self {
            ring,
            fd,
            interface: interface.to_string(),
            ifindex,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            state: State::Running,
            kernel: KernelStats::default(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn geometry(&self) -> &RingGeometry {
        self.ring.geometry()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed || *self.stop_rx.borrow()
    }

    /// Wait for the next user-owned block.
    ///
    /// `Some(Duration::ZERO)` only checks the ring; `None` waits until a
    /// block retires or the session is stopped.
    pub async fn next_block(&mut self, timeout: Option<Duration>) -> Result<NextBlock<'_>, CaptureError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.is_closed() {
                return Ok(NextBlock::Closed);
            }
            if let Some(idx) = self.ring.try_acquire() {
                return Ok(NextBlock::Ready(Block::new(&mut self.ring, idx)));
            }
            match self.wait(deadline).await? {
                Wake::Readable => continue,
                Wake::Timeout => return Ok(NextBlock::Timeout),
                Wake::Stopped => return Ok(NextBlock::Closed),
            }
        }
    }

    pub(crate) fn ring_mut(&mut self) -> &mut PacketRing {
        &mut self.ring
    }

    /// Sleep until the socket is readable, the deadline passes or the
    /// session is stopped. Readiness is cleared on wake; the caller must
    /// re-check the ring before waiting again.
    pub(crate) async fn wait(&mut self, deadline: Option<Instant>) -> Result<Wake, CaptureError> {
        if self.is_closed() {
            return Ok(Wake::Stopped);
        }
        if deadline.is_some_and(|d| d <= Instant::now()) {
            return Ok(Wake::Timeout);
        }

        let sleep = async {
            match deadline {
                Some(deadline) => time::sleep_until(deadline).await,
                None => future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = self.stop_rx.changed() => Ok(Wake::Stopped),
            ready = self.fd.ready(Interest::READABLE | Interest::ERROR) => {
                match ready {
                    Ok(mut guard) => {
                        if guard.ready().is_error() {
                            Err(socket_error(guard.get_inner().as_raw_fd()))
                        } else {
                            guard.clear_ready();
                            Ok(Wake::Readable)
                        }
                    }
                    Err(err) => Err(err),
                }
            }
            _ = sleep => Ok(Wake::Timeout),
        };

        match outcome {
            Ok(wake) => Ok(wake),
            Err(err) => {
                self.state = State::Closed;
                warn!(interface = %self.interface, error = %err, "capture socket failed, closing session");
                Err(CaptureError::socket(&self.interface, "poll", err))
            }
        }
    }

    /// Kernel packet/drop counters since the session opened.
    pub fn kernel_stats(&mut self) -> Result<KernelStats, CaptureError> {
        let mut stats = TpacketStatsV3::default();
        let mut len = mem::size_of::<TpacketStatsV3>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd.get_ref().as_raw_fd(),
                libc::SOL_PACKET,
                PACKET_STATISTICS,
                &mut stats as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(CaptureError::socket(
                &self.interface,
                "PACKET_STATISTICS",
                io::Error::last_os_error(),
            ));
        }
        // The kernel zeroes its counters on every read.
        self.kernel.packets += stats.tp_packets as u64;
        self.kernel.drops += stats.tp_drops as u64;
        self.kernel.freezes += stats.tp_freeze_q_cnt as u64;
        Ok(self.kernel)
    }

    /// Stop and tear down. Equivalent to dropping the session.
    pub fn close(self) {}
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(idx) = self.ring.held() {
            self.ring.release(idx);
        }
        self.stop_tx.send_replace(true);
        debug!(interface = %self.interface, "capture session closed");
    }
}

fn interface_index(interface: &str) -> Result<u32, CaptureError> {
    let not_found = || CaptureError::InterfaceNotFound {
        interface: interface.to_string(),
    };
    if interface.is_empty() || interface.len() >= libc::IFNAMSIZ {
        return Err(not_found());
    }
    let ifname = CString::new(interface).map_err(|_| not_found())?;
    let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if ifindex == 0 {
        return Err(not_found());
    }
    Ok(ifindex)
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn bind_interface(fd: RawFd, ifindex: u32, protocol: u16) -> io::Result<()> {
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = protocol;
    addr.sll_ifindex = ifindex as libc::c_int;

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn enable_promiscuous(fd: RawFd, ifindex: u32) -> io::Result<()> {
    let mreq = PacketMreq {
        mr_ifindex: ifindex as libc::c_int,
        mr_type: PACKET_MR_PROMISC,
        mr_alen: 0,
        mr_address: [0; 8],
    };
    setsockopt(fd, libc::SOL_PACKET, PACKET_ADD_MEMBERSHIP, &mreq)
}

fn socket_error(fd: RawFd) -> io::Error {
    let mut code: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut code as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return io::Error::last_os_error();
    }
    if code == 0 {
        return io::Error::new(io::ErrorKind::Other, "socket reported an error condition");
    }
    io::Error::from_raw_os_error(code)
}

/// `CLOCK_MONOTONIC` in nanoseconds, the clock `bpf_ktime_get_ns` reads.
pub(crate) fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
