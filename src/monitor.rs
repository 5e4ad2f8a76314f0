//! Connects to a device event source and compiles/installs its kernel-side packet filter.

use std::{fmt, io, mem, sync::Arc};

use crate::{
    frame, util, Error, NetlinkHeader, Result, Udev, UdevDevice, UdevEntry, UdevList, UdevSocket,
};

/// Maximum length of BPF socket filters.
pub const BPF_FILTER_LEN: usize = 512;

/// A bounded BPF program builder.
///
/// Writes into a fixed-size scratch array and tracks the next free index; the caller decides
/// when to swap the finished program into the monitor, so a cap overflow during construction
/// never leaves a partial filter installed.
#[derive(Clone, Copy)]
pub struct BpfFilters<const N: usize>([libc::sock_filter; N]);

impl<const N: usize> BpfFilters<N> {
    /// Creates a new, empty [BpfFilters].
    pub const fn new() -> Self {
        Self(
            [libc::sock_filter {
                code: 0,
                jt: 0,
                jf: 0,
                k: 0,
            }; N],
        )
    }

    /// Gets a reference to the list of [`sock_filter`](libc::sock_filter)s.
    pub fn filters(&self) -> &[libc::sock_filter] {
        self.0.as_ref()
    }

    /// Appends a non-jump instruction at index `i`, advancing it on success.
    pub fn bpf_stmt(&mut self, i: &mut usize, code: u16, data: u32) -> Result<()> {
        self.push(i, code, data, 0, 0)
    }

    /// Appends a jump instruction at index `i`, advancing it on success.
    pub fn bpf_jmp(&mut self, i: &mut usize, code: u16, data: u32, jt: u8, jf: u8) -> Result<()> {
        self.push(i, code, data, jt, jf)
    }

    fn push(&mut self, i: &mut usize, code: u16, data: u32, jt: u8, jf: u8) -> Result<()> {
        if *i < N {
            self.0[*i] = libc::sock_filter {
                code,
                k: data,
                jt,
                jf,
            };
            *i = i.saturating_add(1);
            Ok(())
        } else {
            Err(Error::TooBig {
                limit: N,
                attempted: i.saturating_add(1),
            })
        }
    }

    /// Gets the number of set socket filter instructions.
    pub fn len(&self) -> usize {
        self.0
            .iter()
            .filter(|f| f.code != 0 || f.jt != 0 || f.jf != 0 || f.k != 0)
            .count()
    }

    /// Gets whether the [BpfFilters] has any set socket filters.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gets the [BpfFilters] as a [`sock_fprog`](libc::sock_fprog) FFI object.
    ///
    /// SAFETY: the resulting `sock_fprog` contains a mutable pointer into `self`; the caller must
    /// not let it outlive `self` and must not alias it.
    pub fn as_sock_fprog(&mut self) -> libc::sock_fprog {
        libc::sock_fprog {
            len: self.len() as u16,
            filter: self.0.as_mut_ptr(),
        }
    }
}

impl<const N: usize> Default for BpfFilters<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles one end of a device event source.
pub struct UdevMonitor {
    udev: Arc<Udev>,
    sock: i32,
    snl: UdevSocket,
    snl_group: UdevMonitorNetlinkGroup,
    snl_trusted_sender_pid: Option<u32>,
    snl_destination: UdevSocket,
    snl_destination_group: UdevMonitorNetlinkGroup,
    addrlen: usize,
    filter_subsystem_list: UdevList,
    filter_tag_list: UdevList,
    bound: bool,
    filter: BpfFilters<BPF_FILTER_LEN>,
}

impl UdevMonitor {
    /// Creates a new, unbound, unconnected [UdevMonitor].
    pub fn new(udev: Arc<Udev>) -> Result<Self> {
        let filter_subsystem_list = UdevList::new(Arc::clone(&udev)).with_unique(true);
        let filter_tag_list = UdevList::new(Arc::clone(&udev)).with_unique(true);

        Ok(Self {
            udev,
            sock: -1,
            snl: UdevSocket::new_nl(libc::AF_NETLINK, 0, 0),
            snl_group: UdevMonitorNetlinkGroup::None,
            snl_trusted_sender_pid: None,
            snl_destination: UdevSocket::new_nl(libc::AF_NETLINK, 0, 0),
            snl_destination_group: UdevMonitorNetlinkGroup::None,
            addrlen: mem::size_of::<libc::sockaddr_nl>(),
            filter_subsystem_list,
            filter_tag_list,
            bound: false,
            filter: BpfFilters::new(),
        })
    }

    /// Creates a [UdevMonitor] from a group name and an existing socket file descriptor.
    ///
    /// `fd < 0` creates a fresh non-blocking, close-on-exec socket; otherwise the descriptor is
    /// adopted as-is and the monitor is marked bound. `name` is `"kernel"`, `"udev"`, or empty
    /// (no subscription); any other value is rejected.
    pub fn new_from_netlink_fd(udev: Arc<Udev>, name: &str, fd: i32) -> Result<Self> {
        let group = match name.to_lowercase().as_str() {
            "" => UdevMonitorNetlinkGroup::None,
            "kernel" => UdevMonitorNetlinkGroup::Kernel,
            "udev" => {
                if udev.daemon_is_active() {
                    UdevMonitorNetlinkGroup::Userland
                } else {
                    log::debug!(
                        "the udev service seems not to be active, disabling multicast subscription"
                    );
                    UdevMonitorNetlinkGroup::None
                }
            }
            _ => {
                return Err(Error::InvalidArgument(format!("invalid netlink group: {name}")));
            }
        };

        let mut monitor = Self::new(udev)?;

        monitor.set_snl_group(group);
        monitor.set_snl_destination_group(UdevMonitorNetlinkGroup::Userland);

        if fd < 0 {
            // SAFETY: all arguments are valid, and the return value is checked before use.
            monitor.set_sock(unsafe {
                libc::socket(
                    libc::PF_NETLINK,
                    libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                    libc::NETLINK_KOBJECT_UEVENT,
                )
            });

            if monitor.sock() < 0 {
                let errno = io::Error::last_os_error();
                let err_msg = format!("error getting socket: {errno}");
                log::error!("{err_msg}");
                Err(Error::OsError(err_msg))
            } else {
                Ok(monitor)
            }
        } else {
            monitor.set_sock(fd);
            monitor.set_nl_address()?;
            monitor.bound = true;

            Ok(monitor)
        }
    }

    /// Creates a new [UdevMonitor] connected to the named event source.
    ///
    /// Valid source names are `"kernel"` (raw kernel uevents) and `"udev"` (post-processing
    /// events from the device manager daemon, downgraded to no multicast subscription if there
    /// is no live evidence the daemon is running).
    pub fn new_from_netlink(udev: Arc<Udev>, name: &str) -> Result<Self> {
        Self::new_from_netlink_fd(udev, name, -1)
    }

    fn set_nl_address(&mut self) -> Result<()> {
        // SAFETY: `sockaddr_nl` is a well-aligned struct, so zeroing its memory results in a valid
        // stack allocation.
        let mut snl = unsafe { mem::zeroed::<libc::sockaddr_nl>() };
        let mut snl_len = mem::size_of::<libc::sockaddr_nl>() as u32;

        // SAFETY: parameters are initialized properly, and pointers reference valid memory.
        let ret = unsafe {
            libc::getsockname(
                self.sock,
                &mut snl as *mut libc::sockaddr_nl as *mut _,
                &mut snl_len as *mut _,
            )
        };

        if ret >= 0 {
            log::debug!("monitor socket PID: {}", snl.nl_pid);
            self.snl = UdevSocket::Netlink(snl);
            Ok(())
        } else {
            let errno = io::Error::last_os_error();
            Err(Error::OsError(format!("unable to read socket address: {errno}")))
        }
    }

    /// Gets a reference to the [Udev] context.
    pub const fn udev(&self) -> &Arc<Udev> {
        &self.udev
    }

    /// Gets the socket file descriptor.
    pub const fn sock(&self) -> i32 {
        self.sock
    }

    /// Sets the socket file descriptor.
    pub fn set_sock(&mut self, val: i32) {
        self.sock = val;
    }

    /// Gets a reference to the local netlink address.
    pub const fn snl(&self) -> &UdevSocket {
        &self.snl
    }

    /// Gets the local [UdevMonitorNetlinkGroup].
    pub const fn snl_group(&self) -> UdevMonitorNetlinkGroup {
        self.snl_group
    }

    /// Sets the local [UdevMonitorNetlinkGroup].
    pub fn set_snl_group<G: Into<UdevMonitorNetlinkGroup>>(&mut self, val: G) {
        self.snl_group = val.into();
        let groups = self.snl_group as u32;
        self.snl.as_nl_mut().nl_groups = groups;
    }

    /// Authorizes a unicast peer identifier, allowing datagrams sent to this monitor from it.
    pub fn allow_unicast_sender(&mut self, pid: u32) {
        self.snl_trusted_sender_pid = Some(pid);
    }

    /// Revokes any previously authorized unicast sender.
    pub fn revoke_unicast_sender(&mut self) {
        self.snl_trusted_sender_pid = None;
    }

    /// Gets a reference to the destination netlink address used by [`send_device`](Self::send_device).
    pub const fn snl_destination(&self) -> &UdevSocket {
        &self.snl_destination
    }

    /// Gets the destination [UdevMonitorNetlinkGroup].
    pub const fn snl_destination_group(&self) -> UdevMonitorNetlinkGroup {
        self.snl_destination_group
    }

    /// Sets the destination [UdevMonitorNetlinkGroup].
    pub fn set_snl_destination_group<G: Into<UdevMonitorNetlinkGroup>>(&mut self, val: G) {
        self.snl_destination_group = val.into();
        let groups = self.snl_destination_group as u32;
        self.snl_destination.as_nl_mut().nl_groups = groups;
    }

    /// Gets the socket address length.
    pub const fn addrlen(&self) -> usize {
        self.addrlen
    }

    /// Gets a reference to the filter subsystem list.
    pub const fn filter_subsystem_list(&self) -> &UdevList {
        &self.filter_subsystem_list
    }

    /// Gets a reference to the filter tag list.
    pub const fn filter_tag_list(&self) -> &UdevList {
        &self.filter_tag_list
    }

    /// Gets whether the [UdevMonitor] is bound to a socket.
    pub const fn bound(&self) -> bool {
        self.bound
    }

    /// Gets whether an [UdevDevice] passes the current filter spec (§4.5 user-space re-filter).
    ///
    /// Run after every receive to compensate for bloom-filter false positives accepted by the
    /// kernel-side filter, and for datagrams received before a filter update takes effect.
    pub fn passes_filter(&self, device: &UdevDevice) -> bool {
        if self.filter_subsystem_list.is_empty() {
            return self.filter_tag_list.has_tag(device);
        }

        for entry in self.filter_subsystem_list.iter() {
            if entry.name() != device.subsystem() {
                continue;
            }

            let filter_devtype = entry.value();
            if filter_devtype.is_empty() || filter_devtype == device.devtype() {
                return self.filter_tag_list.has_tag(device);
            }
        }

        false
    }

    /// Compiles the current filter spec into a BPF program and installs it on the socket.
    ///
    /// A no-op when both the subsystem and tag filters are empty. Builds into a scratch buffer
    /// and only swaps it into `self`/calls `setsockopt` once the whole program compiles
    /// successfully, so a [`Error::TooBig`] never leaves a partial filter installed.
    pub fn filter_update(&mut self) -> Result<()> {
        if self.filter_subsystem_list.is_empty() && self.filter_tag_list.is_empty() {
            return Ok(());
        }

        let mut ins: BpfFilters<BPF_FILTER_LEN> = BpfFilters::new();
        let mut i = 0usize;

        // load magic in A
        ins.bpf_stmt(
            &mut i,
            (libc::BPF_LD | libc::BPF_W | libc::BPF_ABS) as u16,
            NetlinkHeader::magic_offset() as u32,
        )?;
        // jump if magic matches
        ins.bpf_jmp(
            &mut i,
            (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as u16,
            frame::UDEV_MONITOR_MAGIC,
            1,
            0,
        )?;
        // wrong magic (kernel-framed datagram): pass, let user space classify it
        ins.bpf_stmt(&mut i, (libc::BPF_RET | libc::BPF_K) as u16, 0xffff_ffff)?;

        if !self.filter_tag_list.is_empty() {
            let mut tag_matches = self.filter_tag_list.len();

            for entry in self.filter_tag_list.iter() {
                let tag_bloom_bits = util::string_bloom64(entry.name());
                let tag_bloom_hi = (tag_bloom_bits >> 32) as u32;
                let tag_bloom_lo = tag_bloom_bits as u32;

                // load device bloom bits (hi) in A
                ins.bpf_stmt(
                    &mut i,
                    (libc::BPF_LD | libc::BPF_W | libc::BPF_ABS) as u16,
                    NetlinkHeader::filter_tag_bloom_hi_offset() as u32,
                )?;
                // clear bits not in this tag's bloom value
                ins.bpf_stmt(
                    &mut i,
                    (libc::BPF_ALU | libc::BPF_AND | libc::BPF_K) as u16,
                    tag_bloom_hi,
                )?;
                // jump to next tag's block if it does not match
                ins.bpf_jmp(
                    &mut i,
                    (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as u16,
                    tag_bloom_hi,
                    0,
                    3,
                )?;

                // load device bloom bits (lo) in A
                ins.bpf_stmt(
                    &mut i,
                    (libc::BPF_LD | libc::BPF_W | libc::BPF_ABS) as u16,
                    NetlinkHeader::filter_tag_bloom_lo_offset() as u32,
                )?;
                // clear bits not in this tag's bloom value
                ins.bpf_stmt(
                    &mut i,
                    (libc::BPF_ALU | libc::BPF_AND | libc::BPF_K) as u16,
                    tag_bloom_lo,
                )?;
                // jump past the end of the tag block if it matches
                tag_matches = tag_matches.saturating_sub(1);
                ins.bpf_jmp(
                    &mut i,
                    (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as u16,
                    tag_bloom_lo,
                    1usize.saturating_add(tag_matches.saturating_mul(6)) as u8,
                    0,
                )?;
            }

            // nothing matched, drop packet
            ins.bpf_stmt(&mut i, (libc::BPF_RET | libc::BPF_K) as u16, 0)?;
        }

        if !self.filter_subsystem_list.is_empty() {
            for entry in self.filter_subsystem_list.iter() {
                let hash = util::string_hash32(entry.name());

                // load device subsystem hash in A
                ins.bpf_stmt(
                    &mut i,
                    (libc::BPF_LD | libc::BPF_W | libc::BPF_ABS) as u16,
                    NetlinkHeader::filter_subsystem_hash_offset() as u32,
                )?;

                if entry.value().is_empty() {
                    // jump past accept if subsystem does not match
                    ins.bpf_jmp(
                        &mut i,
                        (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as u16,
                        hash,
                        0,
                        1,
                    )?;
                } else {
                    // jump past the devtype test + accept if subsystem does not match
                    ins.bpf_jmp(
                        &mut i,
                        (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as u16,
                        hash,
                        0,
                        3,
                    )?;

                    // load device devtype hash in A
                    ins.bpf_stmt(
                        &mut i,
                        (libc::BPF_LD | libc::BPF_W | libc::BPF_ABS) as u16,
                        NetlinkHeader::filter_devtype_hash_offset() as u32,
                    )?;

                    // jump past accept if devtype does not match
                    let devtype_hash = util::string_hash32(entry.value());
                    ins.bpf_jmp(
                        &mut i,
                        (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as u16,
                        devtype_hash,
                        0,
                        1,
                    )?;
                }

                // matched, pass packet
                ins.bpf_stmt(&mut i, (libc::BPF_RET | libc::BPF_K) as u16, 0xffff_ffff)?;
            }

            // nothing matched, drop packet
            ins.bpf_stmt(&mut i, (libc::BPF_RET | libc::BPF_K) as u16, 0)?;
        }

        // trailer: accept everything that made it this far
        ins.bpf_stmt(&mut i, (libc::BPF_RET | libc::BPF_K) as u16, 0xffff_ffff)?;

        self.filter = ins;
        let mut fprog = self.filter.as_sock_fprog();

        // SAFETY: arguments are valid, and the pointer references `self.filter`, which outlives
        // this call.
        let err = unsafe {
            libc::setsockopt(
                self.sock,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &mut fprog as *mut libc::sock_fprog as *mut _,
                mem::size_of::<libc::sock_fprog>() as u32,
            )
        };

        if err < 0 {
            let errno = io::Error::last_os_error();
            Err(Error::OsError(format!("error attaching BPF filter: {errno}")))
        } else {
            Ok(())
        }
    }

    /// Binds the monitor's socket to the configured event source and enables credential passing.
    pub fn enable_receiving(&mut self) -> Result<()> {
        self.filter_update()?;

        let err = if !self.bound {
            // SAFETY: all arguments are valid, and pointers reference valid memory.
            unsafe {
                libc::bind(
                    self.sock,
                    self.snl.as_nl_ptr()? as *const _,
                    mem::size_of::<libc::sockaddr_nl>() as u32,
                )
            }
        } else {
            0
        };

        if err < 0 {
            let errno = io::Error::last_os_error();
            let err_msg = format!("bind failed: {errno}");
            log::error!("{err_msg}");
            return Err(Error::OsError(err_msg));
        }

        self.bound = true;
        self.set_nl_address()?;

        let on = 1i32;
        // SAFETY: all arguments are valid, and pointers reference valid memory.
        let err = unsafe {
            libc::setsockopt(
                self.sock,
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                &on as *const i32 as *const _,
                mem::size_of::<i32>() as u32,
            )
        };

        if err < 0 {
            let errno = io::Error::last_os_error();
            let err_msg = format!("setting SO_PASSCRED failed: {errno}");
            log::error!("{err_msg}");
            Err(Error::OsError(err_msg))
        } else {
            Ok(())
        }
    }

    /// Sets the size of the kernel socket buffer. Requires elevated privileges.
    pub fn set_receive_buffer_size(&mut self, size: usize) -> Result<()> {
        let int_size = size as i32;
        // SAFETY: all arguments are valid, and pointers reference valid memory.
        let err = unsafe {
            libc::setsockopt(
                self.sock,
                libc::SOL_SOCKET,
                libc::SO_RCVBUFFORCE,
                &int_size as *const i32 as *const _,
                mem::size_of::<i32>() as u32,
            )
        };

        if err < 0 {
            let errno = io::Error::last_os_error();
            let err_msg = format!("error setting receive buffer size: {errno}");
            log::error!("{err_msg}");
            Err(Error::OsError(err_msg))
        } else {
            Ok(())
        }
    }

    /// Receives and admits exactly one datagram, without re-polling on rejection.
    ///
    /// Returns `Err(Error::Again(..))` for any recoverable rejection (malformed datagram, failed
    /// admission, filtered out); callers that want the bounded drain behavior should use
    /// [`receive_device`](Self::receive_device) instead.
    pub fn receive_device_one(&mut self) -> Result<UdevDevice> {
        let mut buf = [0u8; 8192];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut _,
            iov_len: buf.len(),
        };

        let mut cred_msg = [0u8; 64];

        // SAFETY: `libc::sockaddr_nl` has a known size and is well-aligned; `snl` is initialized
        // by the `recvmsg` syscall below before being read.
        let mut snl: libc::sockaddr_nl = unsafe { mem::zeroed() };
        snl.nl_family = libc::AF_NETLINK as u16;

        // SAFETY: `libc::msghdr` has a known size and is well-aligned; every field is set below
        // before the syscall reads it.
        let mut smsg: libc::msghdr = unsafe { mem::zeroed() };
        smsg.msg_iov = &mut iov as *mut libc::iovec as *mut _;
        smsg.msg_iovlen = 1;
        smsg.msg_control = cred_msg.as_mut_ptr() as *mut _;
        smsg.msg_controllen = cred_msg.len();
        smsg.msg_name = &mut snl as *mut libc::sockaddr_nl as *mut _;
        smsg.msg_namelen = mem::size_of::<libc::sockaddr_nl>() as u32;

        // SAFETY: all parameters are properly initialized, and point to valid memory.
        let buflen = unsafe { libc::recvmsg(self.sock, &mut smsg as *mut _, 0) };

        if buflen < 0 {
            let errno = io::Error::last_os_error();
            let raw = errno.raw_os_error();
            let would_block = raw == Some(libc::EAGAIN)
                || raw == Some(libc::EWOULDBLOCK)
                || raw == Some(libc::EINTR);

            return if would_block {
                Err(Error::Again(format!("no message available: {errno}")))
            } else {
                Err(Error::OsError(format!("unable to receive message: {errno}")))
            };
        }

        if smsg.msg_flags & libc::MSG_TRUNC != 0 {
            return Err(Error::Again("received message was truncated".into()));
        }

        self.admit(&snl)?;

        let ucred = parse_cmsg(cred_msg.as_ref())?;
        if ucred.uid != 0 {
            return Err(Error::Again(format!(
                "sender uid={}, message ignored",
                ucred.uid
            )));
        }

        let decoded = frame::decode_frame(buf.as_ref(), buflen as usize)?;
        let (bufpos, is_initialized) = match decoded {
            frame::DecodedFrame::Library { properties_off } => (properties_off, true),
            frame::DecodedFrame::Kernel { header_len } => (header_len, false),
        };

        let mut device = UdevDevice::new_from_nulstr(Arc::clone(&self.udev), buf[bufpos..].as_ref())
            .map_err(|e| Error::Again(format!("could not decode device: {e}")))?;

        if is_initialized {
            device.set_is_initialized(true);
        }

        if self.passes_filter(&device) {
            Ok(device)
        } else {
            Err(Error::Again("device did not pass filter".into()))
        }
    }

    /// Receives a device, discarding datagrams that fail admission or the user-space filter
    /// until one passes or the socket reports no more immediately available data.
    pub fn receive_device(&mut self) -> Result<UdevDevice> {
        // bounded to avoid spinning forever against a socket under sustained load
        for _ in 0..1024 {
            match self.receive_device_one() {
                Ok(device) => return Ok(device),
                Err(Error::Again(msg)) => {
                    log::debug!("{msg}");

                    let mut pfd = [libc::pollfd {
                        fd: self.sock,
                        events: libc::POLLIN,
                        revents: 0,
                    }];

                    // SAFETY: `pollfd` is properly initialized and the pointer references valid
                    // memory for the duration of the call.
                    let ready = unsafe { libc::poll(pfd.as_mut_ptr(), pfd.len() as _, 0) };

                    if ready > 0 {
                        continue;
                    }

                    return Err(Error::Again("no queued devices".into()));
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Again("receive retries exceeded".into()))
    }

    fn admit(&self, sender: &libc::sockaddr_nl) -> Result<()> {
        if sender.nl_groups == 0 {
            let trusted = self.snl_trusted_sender_pid.unwrap_or(0);
            if trusted == 0 || sender.nl_pid != trusted {
                return Err(Error::Again("unicast netlink message ignored".into()));
            }
        } else if sender.nl_groups == UdevMonitorNetlinkGroup::Kernel as u32 && sender.nl_pid != 0 {
            return Err(Error::Again(format!(
                "multicast kernel netlink message from PID {} ignored",
                sender.nl_pid
            )));
        }

        Ok(())
    }

    /// Sends a device to another monitor (or the configured default destination if `None`).
    ///
    /// A `ECONNREFUSED` while sending to the default multicast destination (no explicit
    /// `destination` given) means there were no subscribers; this is not an error and is
    /// reported as `Ok(0)`. The same error against an explicit `destination` is a real failure
    /// and is returned as `Error::OsError`.
    pub fn send_device(
        &mut self,
        destination: Option<&mut Self>,
        device: &mut UdevDevice,
    ) -> Result<isize> {
        let mut buf = device.get_properties_monitor_buf().to_owned();
        let blen = buf.len();

        if blen < 32 {
            return Err(Error::InvalidArgument(
                "device properties buffer is too small to contain a valid device".into(),
            ));
        }

        let mut header = NetlinkHeader::new();
        header.filter_subsystem_hash = util::string_hash32(device.subsystem());

        if !device.devtype().is_empty() {
            header.filter_devtype_hash = util::string_hash32(device.devtype());
        }

        let mut tag_bloom_bits = 0u64;
        for entry in device.tags_list().iter() {
            tag_bloom_bits |= util::string_bloom64(entry.name());
        }

        if tag_bloom_bits > 0 {
            header.filter_tag_bloom_hi = (tag_bloom_bits >> 32) as u32;
            header.filter_tag_bloom_lo = tag_bloom_bits as u32;
        }

        header.properties_off = frame::HEADER_LEN as u32;
        header.properties_len = blen as u32;

        let mut encoded = header.encode();

        let mut iov = [
            libc::iovec {
                iov_base: encoded.as_mut_ptr() as *mut _,
                iov_len: encoded.len(),
            },
            libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut _,
                iov_len: blen,
            },
        ];

        let explicit_destination = destination.is_some();

        let dest_pid = match destination.as_ref() {
            Some(dest) => dest.snl.pid()?,
            None => self.snl_destination.pid()?,
        };

        let mut smsg = libc::msghdr {
            msg_iov: iov.as_mut_ptr() as *mut _,
            msg_iovlen: iov.len(),
            msg_control: core::ptr::null_mut(),
            msg_controllen: 0,
            msg_flags: 0,
            msg_name: match destination {
                Some(dest) => dest.snl.as_nl_ptr_mut()? as *mut _,
                None => self.snl_destination.as_nl_ptr_mut()? as *mut _,
            },
            msg_namelen: mem::size_of::<libc::sockaddr_nl>() as u32,
        };

        // SAFETY: `smsg` is fully initialized and its iov/name pointers reference valid memory
        // for the duration of this call.
        let count = unsafe { libc::sendmsg(self.sock, &mut smsg as *mut _, 0) };

        if count < 0 {
            let errno = io::Error::last_os_error();
            if !explicit_destination && errno.raw_os_error() == Some(libc::ECONNREFUSED) {
                log::debug!("no subscribers for device, monitor PID({dest_pid})");
                Ok(0)
            } else {
                Err(Error::OsError(format!("sending device failed: {errno}")))
            }
        } else {
            log::debug!("sent {count} byte device to monitor PID({dest_pid})");
            Ok(count)
        }
    }

    /// Adds a subsystem/devtype entry to the filter spec.
    ///
    /// Repeated calls for the same subsystem overwrite the devtype. Takes effect on the wire
    /// only after the next [`filter_update`](Self::filter_update).
    pub fn filter_add_match_subsystem_devtype(
        &mut self,
        subsystem: &str,
        devtype: &str,
    ) -> Result<&UdevEntry> {
        if subsystem.is_empty() {
            return Err(Error::InvalidArgument("empty subsystem filter".into()));
        }

        self.filter_subsystem_list
            .add_entry(subsystem, devtype)
            .ok_or(Error::OutOfMemory)
    }

    /// Adds a tag to the filter spec. Idempotent: adding the same tag twice is not an error and
    /// leaves a single entry.
    pub fn filter_add_match_tag(&mut self, tag: &str) -> Result<&UdevEntry> {
        if tag.is_empty() {
            return Err(Error::InvalidArgument("empty tag filter".into()));
        }

        self.filter_tag_list
            .add_entry(tag, "")
            .ok_or(Error::OutOfMemory)
    }

    /// Clears both filter collections and detaches any installed kernel filter.
    pub fn filter_remove(&mut self) -> Result<()> {
        let mut filter = libc::sock_fprog {
            len: 0,
            filter: std::ptr::null_mut(),
        };

        self.filter_subsystem_list.clear();
        self.filter_tag_list.clear();

        // SAFETY: all arguments are valid, and pointers reference valid memory.
        let ret = unsafe {
            libc::setsockopt(
                self.sock,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &mut filter as *mut libc::sock_fprog as *mut _,
                mem::size_of::<libc::sock_fprog>() as u32,
            )
        };

        if ret != 0 {
            let errno = io::Error::last_os_error();
            Err(Error::OsError(format!("unable to remove kernel filter: {errno}")))
        } else {
            Ok(())
        }
    }

    /// Closes the socket. Idempotent.
    pub fn close(&mut self) {
        if self.sock >= 0 {
            // SAFETY: `self.sock` is a valid, owned descriptor until this call.
            unsafe {
                libc::close(self.sock);
            }
            self.sock = -1;
        }
    }
}

impl Drop for UdevMonitor {
    fn drop(&mut self) {
        self.close();
    }
}

fn parse_cmsg(msg_control: &[u8]) -> Result<libc::ucred> {
    let header_len = mem::size_of::<libc::cmsghdr>();
    let ucred_len = mem::size_of::<libc::ucred>();
    let int_len = mem::size_of::<libc::c_int>();

    let read_i32 = |buf: &[u8], idx: usize| -> i32 {
        i32::from_ne_bytes(buf[idx..idx + int_len].try_into().unwrap_or([0u8; 4]))
    };

    if msg_control.len() >= header_len + ucred_len {
        let mut idx = int_len * 3; // skip cmsg_len, cmsg_level, read cmsg_type
        let cmsg_type = read_i32(msg_control, idx);
        idx += int_len;

        if cmsg_type != libc::SCM_CREDENTIALS {
            return Err(Error::Again(
                "no sender credentials received, message ignored".into(),
            ));
        }

        let pid = read_i32(msg_control, idx);
        idx += int_len;
        let uid = read_i32(msg_control, idx) as libc::uid_t;
        idx += int_len;
        let gid = read_i32(msg_control, idx) as libc::gid_t;

        Ok(libc::ucred { pid, uid, gid })
    } else if msg_control.len() >= ucred_len {
        let mut idx = 0;
        let pid = read_i32(msg_control, idx);
        idx += int_len;
        let uid = read_i32(msg_control, idx) as libc::uid_t;
        idx += int_len;
        let gid = read_i32(msg_control, idx) as libc::gid_t;

        Ok(libc::ucred { pid, uid, gid })
    } else {
        Err(Error::Again(format!(
            "msg_controllen ({}) is too small for a cmsghdr",
            msg_control.len()
        )))
    }
}

/// The netlink multicast group a [UdevMonitor] subscribes to.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum UdevMonitorNetlinkGroup {
    #[default]
    None,
    Kernel,
    Userland,
}

impl From<&str> for UdevMonitorNetlinkGroup {
    fn from(val: &str) -> Self {
        match val.to_lowercase().as_str() {
            "kernel" => Self::Kernel,
            "udev" => Self::Userland,
            _ => Self::None,
        }
    }
}

impl From<u32> for UdevMonitorNetlinkGroup {
    fn from(val: u32) -> Self {
        match val {
            1 => Self::Kernel,
            2 => Self::Userland,
            _ => Self::None,
        }
    }
}

impl From<&UdevMonitorNetlinkGroup> for &'static str {
    fn from(val: &UdevMonitorNetlinkGroup) -> Self {
        match val {
            UdevMonitorNetlinkGroup::None => "none",
            UdevMonitorNetlinkGroup::Kernel => "kernel",
            UdevMonitorNetlinkGroup::Userland => "udev",
        }
    }
}

impl fmt::Display for UdevMonitorNetlinkGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&str>::from(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udev() -> Arc<Udev> {
        Arc::new(Udev::new())
    }

    fn device_with(udev: &Arc<Udev>, subsystem: &str, devtype: &str, tags: &[&str]) -> UdevDevice {
        let mut device = UdevDevice::new(Arc::clone(udev));
        device.set_subsystem(subsystem.to_owned());
        if !devtype.is_empty() {
            device.set_devtype(devtype.to_owned());
        }
        for tag in tags {
            device.add_tag(*tag);
        }
        device
    }

    #[test]
    fn test_group_from_name() {
        assert_eq!(UdevMonitorNetlinkGroup::from("kernel"), UdevMonitorNetlinkGroup::Kernel);
        assert_eq!(UdevMonitorNetlinkGroup::from("udev"), UdevMonitorNetlinkGroup::Userland);
        assert_eq!(UdevMonitorNetlinkGroup::from("bogus"), UdevMonitorNetlinkGroup::None);
    }

    #[test]
    fn test_passes_filter_empty_is_permissive() {
        let udev = udev();
        let monitor = UdevMonitor::new(Arc::clone(&udev)).unwrap();
        let device = device_with(&udev, "block", "disk", &[]);
        assert!(monitor.passes_filter(&device));
    }

    #[test]
    fn test_passes_filter_subsystem_only_ignores_devtype() {
        let udev = udev();
        let mut monitor = UdevMonitor::new(Arc::clone(&udev)).unwrap();
        monitor.filter_add_match_subsystem_devtype("block", "").unwrap();

        // no devtype on the filter entry: subsystem match alone is sufficient, even though the
        // device itself carries no devtype.
        let device = device_with(&udev, "block", "", &[]);
        assert!(monitor.passes_filter(&device));
    }

    #[test]
    fn test_passes_filter_subsystem_and_devtype() {
        let udev = udev();
        let mut monitor = UdevMonitor::new(Arc::clone(&udev)).unwrap();
        monitor.filter_add_match_subsystem_devtype("block", "disk").unwrap();

        assert!(monitor.passes_filter(&device_with(&udev, "block", "disk", &[])));
        assert!(!monitor.passes_filter(&device_with(&udev, "block", "partition", &[])));
        assert!(!monitor.passes_filter(&device_with(&udev, "net", "disk", &[])));
    }

    #[test]
    fn test_passes_filter_tag_gate_applies_after_subsystem_match() {
        let udev = udev();
        let mut monitor = UdevMonitor::new(Arc::clone(&udev)).unwrap();
        monitor.filter_add_match_subsystem_devtype("block", "").unwrap();
        monitor.filter_add_match_tag("watched").unwrap();

        assert!(monitor.passes_filter(&device_with(&udev, "block", "", &["watched"])));
        assert!(!monitor.passes_filter(&device_with(&udev, "block", "", &["other"])));
    }

    #[test]
    fn test_filter_add_match_tag_idempotent() {
        let udev = udev();
        let mut monitor = UdevMonitor::new(udev).unwrap();
        monitor.filter_add_match_tag("foo").unwrap();
        monitor.filter_add_match_tag("foo").unwrap();
        assert_eq!(monitor.filter_tag_list().len(), 1);
    }

    #[test]
    fn test_filter_add_match_subsystem_overwrites_devtype() {
        let udev = udev();
        let mut monitor = UdevMonitor::new(udev).unwrap();
        monitor.filter_add_match_subsystem_devtype("block", "disk").unwrap();
        monitor.filter_add_match_subsystem_devtype("block", "partition").unwrap();
        assert_eq!(monitor.filter_subsystem_list().len(), 1);
        assert_eq!(
            monitor.filter_subsystem_list().entry_by_name("block").unwrap().value(),
            "partition"
        );
    }

    #[test]
    fn test_filter_add_match_subsystem_rejects_empty() {
        let udev = udev();
        let mut monitor = UdevMonitor::new(udev).unwrap();
        assert!(monitor.filter_add_match_subsystem_devtype("", "disk").is_err());
    }

    #[test]
    fn test_admit_rejects_unicast_without_trust() {
        let udev = udev();
        let monitor = UdevMonitor::new(udev).unwrap();

        // SAFETY: zeroed `sockaddr_nl` is a valid, if inert, stack value.
        let mut sender: libc::sockaddr_nl = unsafe { mem::zeroed() };
        sender.nl_groups = 0;
        sender.nl_pid = 99;

        assert!(monitor.admit(&sender).is_err());
    }

    #[test]
    fn test_admit_allows_trusted_unicast() {
        let udev = udev();
        let mut monitor = UdevMonitor::new(udev).unwrap();
        monitor.allow_unicast_sender(99);

        // SAFETY: zeroed `sockaddr_nl` is a valid, if inert, stack value.
        let mut sender: libc::sockaddr_nl = unsafe { mem::zeroed() };
        sender.nl_groups = 0;
        sender.nl_pid = 99;

        assert!(monitor.admit(&sender).is_ok());
    }

    #[test]
    fn test_admit_rejects_spoofed_kernel_pid() {
        let udev = udev();
        let monitor = UdevMonitor::new(udev).unwrap();

        // SAFETY: zeroed `sockaddr_nl` is a valid, if inert, stack value.
        let mut sender: libc::sockaddr_nl = unsafe { mem::zeroed() };
        sender.nl_groups = UdevMonitorNetlinkGroup::Kernel as u32;
        sender.nl_pid = 1234;

        assert!(monitor.admit(&sender).is_err());
    }

    #[test]
    fn test_admit_allows_genuine_kernel_sender() {
        let udev = udev();
        let monitor = UdevMonitor::new(udev).unwrap();

        // SAFETY: zeroed `sockaddr_nl` is a valid, if inert, stack value.
        let mut sender: libc::sockaddr_nl = unsafe { mem::zeroed() };
        sender.nl_groups = UdevMonitorNetlinkGroup::Kernel as u32;
        sender.nl_pid = 0;

        assert!(monitor.admit(&sender).is_ok());
    }

    #[test]
    fn test_filter_update_noop_when_empty() {
        let udev = udev();
        let mut monitor = UdevMonitor::new(udev).unwrap();
        // no socket is open; a no-op filter_update must not attempt setsockopt at all.
        assert!(monitor.filter_update().is_ok());
    }

    #[test]
    fn test_bpf_filters_too_big() {
        let mut filters: BpfFilters<2> = BpfFilters::new();
        let mut i = 0usize;
        filters.bpf_stmt(&mut i, 0, 0).unwrap();
        filters.bpf_stmt(&mut i, 0, 0).unwrap();
        assert!(matches!(
            filters.bpf_stmt(&mut i, 0, 0),
            Err(Error::TooBig { limit: 2, .. })
        ));
    }

    #[test]
    fn test_filter_remove_clears_collections() {
        let udev = udev();
        let mut monitor = UdevMonitor::new(udev).unwrap();
        monitor.filter_add_match_subsystem_devtype("block", "disk").unwrap();
        monitor.filter_add_match_tag("watched").unwrap();

        // the socket is never opened in this test, so the detach syscall itself fails; the
        // collections must still be cleared since `filter_remove` clears them unconditionally
        // before attempting to detach the kernel-side program.
        let _ = monitor.filter_remove();

        assert!(monitor.filter_subsystem_list().is_empty());
        assert!(monitor.filter_tag_list().is_empty());
    }

    #[test]
    fn test_new_from_netlink_fd_rejects_unknown_group_name() {
        let udev = udev();
        assert!(matches!(
            UdevMonitor::new_from_netlink_fd(udev, "bogus", -1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_new_from_netlink_fd_empty_name_is_no_subscription() {
        let udev = udev();
        let monitor = UdevMonitor::new_from_netlink_fd(udev, "", -1).unwrap();
        assert_eq!(monitor.snl_group(), UdevMonitorNetlinkGroup::None);
    }
}
