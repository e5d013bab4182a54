// poll(2) wrapper shared by the standalone selector and LocalMainContext,
// plus the self-pipe that lets other threads interrupt a blocking wait

use crate::native::IoCondition;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

fn to_poll_events(condition: IoCondition) -> libc::c_short {
    let mut events = 0;
    if condition.contains(IoCondition::IN) {
        events |= libc::POLLIN;
    }
    if condition.contains(IoCondition::PRI) {
        events |= libc::POLLPRI;
    }
    if condition.contains(IoCondition::OUT) {
        events |= libc::POLLOUT;
    }
    events
}

fn from_poll_events(revents: libc::c_short) -> IoCondition {
    let mut condition = IoCondition::empty();
    if revents & libc::POLLIN != 0 {
        condition |= IoCondition::IN;
    }
    if revents & libc::POLLPRI != 0 {
        condition |= IoCondition::PRI;
    }
    if revents & libc::POLLOUT != 0 {
        condition |= IoCondition::OUT;
    }
    if revents & libc::POLLERR != 0 {
        condition |= IoCondition::ERR;
    }
    if revents & libc::POLLHUP != 0 {
        condition |= IoCondition::HUP;
    }
    if revents & libc::POLLNVAL != 0 {
        condition |= IoCondition::NVAL;
    }
    condition
}

/// Rounds up so a sub-millisecond wait does not turn into a busy loop
fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => d
            .as_nanos()
            .div_ceil(1_000_000)
            .min(libc::c_int::MAX as u128) as libc::c_int,
    }
}

/// Wait until one of `watches` is ready or `timeout` elapses.
///
/// Returns the reported conditions, one per watch, in the same order.
/// With no watches this sleeps for `timeout`; callers must not pass `None`
/// in that case. An interrupted wait reports nothing ready.
pub(crate) fn wait_fds(
    watches: &[(RawFd, IoCondition)],
    timeout: Option<Duration>,
) -> io::Result<Vec<IoCondition>> {
    if watches.is_empty() {
        if let Some(d) = timeout {
            if !d.is_zero() {
                std::thread::sleep(d);
            }
        }
        return Ok(Vec::new());
    }

    let mut fds: Vec<libc::pollfd> = watches
        .iter()
        .map(|(fd, condition)| libc::pollfd {
            fd: *fd,
            events: to_poll_events(*condition),
            revents: 0,
        })
        .collect();

    // SAFETY: `fds` is a valid, initialised slice for the duration of the call.
    let rc = unsafe {
        libc::poll(
            fds.as_mut_ptr(),
            fds.len() as libc::nfds_t,
            timeout_millis(timeout),
        )
    };

    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(vec![IoCondition::empty(); watches.len()]);
        }
        return Err(err);
    }

    Ok(fds.iter().map(|p| from_poll_events(p.revents)).collect())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an fd we own; no memory is passed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Non-blocking pipe; writing a byte makes the read end readable
#[derive(Debug)]
pub(crate) struct WakePipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl WakePipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe(2) succeeded, both fds are open and owned by nobody else.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_nonblocking(read.as_raw_fd())?;
        set_nonblocking(write.as_raw_fd())?;
        Ok(Self { read, write })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Make the read end readable; a full pipe already is
    pub(crate) fn notify(&self) {
        let byte = 1u8;
        // SAFETY: writes one byte from a live stack variable.
        let _ = unsafe { libc::write(self.write.as_raw_fd(), (&byte as *const u8).cast(), 1) };
    }

    /// Consume every pending notification
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: reads into a live stack buffer of the given length.
            let n = unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}
