//! Pure Rust library for monitoring kernel device events over the `udev` netlink protocol.
//!
//! Uses the [`libc`](https://crates.io/crates/libc) crate to make syscalls to Linux, and compiles
//! a classic BPF packet filter that the kernel applies to the monitor socket before a datagram
//! ever reaches user space.

mod context;
mod device;
mod error;
mod file;
mod frame;
mod list;
mod log;
mod monitor;
mod murmur_hash;
mod socket;
mod util;

pub use context::*;
pub use device::*;
pub use error::*;
pub use file::*;
pub use frame::*;
pub use list::*;
pub use log::*;
pub use monitor::*;
pub use murmur_hash::*;
pub use socket::*;
pub use util::*;
