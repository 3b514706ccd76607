// Helper class for watching file descriptors
//
// Wait for a set of fds to become readable with a bounded
// timeout. Used for waiting on exported sync fds and on DRM
// event fds, where the wait happens on threads that do not
// own a device dispatch table.
//
// Austin Shafer - 2025
extern crate nix;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// A file descriptor watcher
pub struct FdWatch {
    // The fds to watch for readability
    fdw_fds: Vec<RawFd>,
}

impl FdWatch {
    pub fn new() -> FdWatch {
        FdWatch { fdw_fds: Vec::new() }
    }

    pub fn add_fd(&mut self, fd: RawFd) {
        self.fdw_fds.push(fd);
    }

    pub fn remove_fd(&mut self, fd: RawFd) {
        self.fdw_fds.retain(|f| *f != fd);
    }

    /// Wait for any watched fd to become readable.
    ///
    /// `timeout_ns` of None waits forever. Returns Ok(true) if an
    /// fd is ready, Ok(false) if the timeout expired. EINTR and
    /// EAGAIN are retried with the remaining timeout.
    pub fn wait_readable(&self, timeout_ns: Option<u64>) -> crate::Result<bool> {
        let deadline = timeout_ns.map(|ns| Instant::now() + Duration::from_nanos(ns));

        loop {
            // poll(2) takes a millisecond timeout. Clamp long waits
            // and loop so the deadline is still honored.
            let poll_timeout = match deadline {
                None => PollTimeout::NONE,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        PollTimeout::ZERO
                    } else {
                        let ms = (d - now).as_millis().min(u16::MAX as u128) as u16;
                        PollTimeout::from(ms.max(1))
                    }
                }
            };

            let mut fds: Vec<PollFd> = self
                .fdw_fds
                .iter()
                .map(|fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN))
                .collect();

            match poll(&mut fds, poll_timeout) {
                Ok(0) => {
                    if let Some(d) = deadline {
                        if Instant::now() >= d {
                            return Ok(false);
                        }
                    }
                }
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(e) => return Err(crate::anyhow!("poll failed: {}", e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn pipe_readability() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut watch = FdWatch::new();
        watch.add_fd(read_end.as_raw_fd());

        // Nothing written yet, a short wait should time out
        assert!(!watch.wait_readable(Some(10_000_000)).unwrap());

        nix::unistd::write(&write_end, &[1u8]).unwrap();
        assert!(watch.wait_readable(Some(1_000_000_000)).unwrap());
    }
}
