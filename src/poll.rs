//! Readiness multiplexing over `poll(2)`.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn events(self) -> libc::c_short {
        match self {
            Interest::Read => libc::POLLIN,
            Interest::Write => libc::POLLOUT,
        }
    }
}

/// Reusable `pollfd` set. Slots follow the order of the descriptors passed to `wait`.
#[derive(Default)]
pub struct Poller {
    fds: Vec<libc::pollfd>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `timeout` for any descriptor to become ready and returns
    /// how many are. An interrupted wait reports nothing ready.
    pub fn wait(
        &mut self,
        fds: impl IntoIterator<Item = RawFd>,
        interest: Interest,
        timeout: Duration,
    ) -> io::Result<usize> {
        let events = interest.events();
        self.fds.clear();
        self.fds.extend(fds.into_iter().map(|fd| libc::pollfd {
            fd,
            events,
            revents: 0,
        }));
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: `fds` is a valid, exclusively borrowed array of `len` pollfds.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                self.fds.iter_mut().for_each(|fd| fd.revents = 0);
                return Ok(0);
            }
            return Err(err);
        }
        Ok(rc as usize)
    }

    /// Whether slot `index` can make progress. Errors and hang-ups count as
    /// ready so the next read or write surfaces them.
    pub fn is_ready(&self, index: usize) -> bool {
        self.fds.get(index).is_some_and(|fd| {
            fd.revents & (fd.events | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
        })
    }
}
