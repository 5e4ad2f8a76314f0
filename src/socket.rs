use std::mem;

use libc::sockaddr_nl;

use crate::Result;

/// A netlink socket address, with the helpers the monitor needs to read/write its fields.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UdevSocket {
    Netlink(sockaddr_nl),
}

impl UdevSocket {
    /// Gets the kernel-provided PID for the socket.
    pub fn pid(&self) -> Result<u32> {
        match self {
            Self::Netlink(socket) => Ok(socket.nl_pid),
        }
    }

    /// Creates a new [UdevSocket] for a [`sockaddr_nl`] netlink socket type.
    pub fn new_nl(family: i32, pid: u32, groups: u32) -> Self {
        // SAFETY: `sockaddr_nl` is a well-aligned struct, so zeroing its memory results in a valid
        // stack allocation.
        let mut nl = unsafe { mem::zeroed::<sockaddr_nl>() };

        nl.nl_family = family as u16;
        nl.nl_pid = pid;
        nl.nl_groups = groups;

        Self::Netlink(nl)
    }

    /// Gets the [UdevSocket] as a reference to a [`sockaddr_nl`](libc::sockaddr_nl).
    pub fn as_nl(&self) -> &sockaddr_nl {
        match self {
            Self::Netlink(nl) => nl,
        }
    }

    /// Gets the [UdevSocket] as a mutable reference to a [`sockaddr_nl`](libc::sockaddr_nl).
    pub fn as_nl_mut(&mut self) -> &mut sockaddr_nl {
        match self {
            Self::Netlink(nl) => nl,
        }
    }

    /// Gets the [UdevSocket] as a const pointer to a [`sockaddr_nl`](libc::sockaddr_nl).
    pub fn as_nl_ptr(&self) -> Result<*const sockaddr_nl> {
        match self {
            Self::Netlink(nl) => Ok(nl as *const _),
        }
    }

    /// Gets the [UdevSocket] as a mutable pointer to a [`sockaddr_nl`](libc::sockaddr_nl).
    pub fn as_nl_ptr_mut(&mut self) -> Result<*mut sockaddr_nl> {
        match self {
            Self::Netlink(nl) => Ok(nl as *mut _),
        }
    }

    /// Gets the group mask set on this address.
    pub fn groups(&self) -> u32 {
        self.as_nl().nl_groups
    }
}

impl Default for UdevSocket {
    fn default() -> Self {
        Self::new_nl(libc::AF_NETLINK, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_nl() {
        let sock = UdevSocket::new_nl(libc::AF_NETLINK, 42, 2);
        assert_eq!(sock.pid().unwrap(), 42);
        assert_eq!(sock.groups(), 2);
        assert_eq!(sock.as_nl().nl_family, libc::AF_NETLINK as u16);
    }

    #[test]
    fn test_default_is_unbound() {
        let sock = UdevSocket::default();
        assert_eq!(sock.pid().unwrap(), 0);
        assert_eq!(sock.groups(), 0);
    }

    #[test]
    fn test_as_nl_ptr_roundtrip() {
        let mut sock = UdevSocket::new_nl(libc::AF_NETLINK, 7, 0);
        let ptr = sock.as_nl_ptr_mut().unwrap();
        // SAFETY: `ptr` was just derived from `sock` and is valid for the duration of this read.
        let pid = unsafe { (*ptr).nl_pid };
        assert_eq!(pid, 7);
    }
}
