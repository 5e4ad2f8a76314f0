use std::{fmt, fs, io};

use crate::{file_handle, name_to_handle_at, LogPriority};

/// Default filesystem path for the run directory, overridable for tests.
pub const UDEV_ROOT_RUN: &str = "/run";

/// Library context.
///
/// Carries the filesystem roots used by the netlink-group downgrade probes and the configured
/// log verbosity. Passed by reference-counted handle to every constructor that needs it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Udev {
    sys_path: String,
    dev_path: String,
    run_path: String,
    log_priority: LogPriority,
}

impl Udev {
    /// Creates a new [Udev] using the default system paths.
    pub fn new() -> Self {
        Self {
            sys_path: String::new(),
            dev_path: String::new(),
            run_path: UDEV_ROOT_RUN.into(),
            log_priority: LogPriority::new(),
        }
    }

    /// Convenience function for library log messages, gated on the configured [LogPriority].
    pub fn log<M: fmt::Display>(&self, priority: LogPriority, msg: M) {
        if priority <= self.log_priority {
            match priority {
                LogPriority::Emergency
                | LogPriority::Alert
                | LogPriority::Critical
                | LogPriority::Error => log::error!("{priority}: {msg}"),
                LogPriority::Warning => log::warn!("{priority}: {msg}"),
                LogPriority::Notice | LogPriority::Info => log::info!("{priority}: {msg}"),
                LogPriority::Debug => log::debug!("{priority}: {msg}"),
            }
        }
    }

    /// Gets the system path.
    pub fn sys_path(&self) -> &str {
        self.sys_path.as_str()
    }

    /// Sets the system path.
    pub fn set_sys_path<P: Into<String>>(&mut self, path: P) {
        self.sys_path = path.into();
    }

    /// Builder function that sets the system path.
    pub fn with_sys_path<P: Into<String>>(mut self, path: P) -> Self {
        self.set_sys_path(path);
        self
    }

    /// Gets the device path.
    pub fn dev_path(&self) -> &str {
        self.dev_path.as_str()
    }

    /// Sets the device path.
    pub fn set_dev_path<P: Into<String>>(&mut self, path: P) {
        self.dev_path = path.into();
    }

    /// Builder function that sets the device path.
    pub fn with_dev_path<P: Into<String>>(mut self, path: P) -> Self {
        self.set_dev_path(path);
        self
    }

    /// Gets the run path.
    pub fn run_path(&self) -> &str {
        self.run_path.as_str()
    }

    /// Sets the run path.
    pub fn set_run_path<P: Into<String>>(&mut self, path: P) {
        self.run_path = path.into();
    }

    /// Builder function that sets the run path.
    pub fn with_run_path<P: Into<String>>(mut self, path: P) -> Self {
        self.set_run_path(path);
        self
    }

    /// Gets the [LogPriority].
    pub const fn log_priority(&self) -> LogPriority {
        self.log_priority
    }

    /// Sets the [LogPriority].
    pub fn set_log_priority<P: Into<LogPriority>>(&mut self, priority: P) {
        self.log_priority = priority.into();
    }

    /// Builder function that sets the [LogPriority].
    pub fn with_log_priority<P: Into<LogPriority>>(mut self, priority: P) -> Self {
        self.set_log_priority(priority);
        self
    }

    /// Gets whether the device manager daemon's control socket is reachable under `run_path`.
    ///
    /// Used, together with [`has_devtmpfs`](Self::has_devtmpfs), to decide whether subscribing
    /// to the daemon's post-processing multicast group makes sense.
    pub fn has_udev_control_path(&self) -> bool {
        fs::OpenOptions::new()
            .read(true)
            .open(format!("{}/udev/control", self.run_path))
            .is_ok()
    }

    /// Gets whether `/dev` is mounted on `devtmpfs`.
    pub fn has_devtmpfs(&self) -> bool {
        use io::BufRead;

        let mut handle = file_handle::new();
        let mut mount_id = 0i32;

        if let (Ok(f), Ok(_)) = (
            fs::OpenOptions::new()
                .read(true)
                .open("/proc/self/mountinfo"),
            name_to_handle_at(libc::AT_FDCWD, "/dev", &mut handle, &mut mount_id, 0),
        ) {
            let mut reader = io::BufReader::new(f);
            let mut line = String::new();
            let mut ret = false;

            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }

                let Some(mid) = line.split_whitespace().next().and_then(|f| f.parse::<i32>().ok())
                else {
                    continue;
                };

                if mid != mount_id {
                    continue;
                }

                if let Some(e) = line.find(" - ") {
                    if let Some(p) = line[e..].strip_prefix(" - ") {
                        // accept any name that starts with the currently expected type
                        if p.starts_with("devtmpfs") {
                            ret = true;
                            break;
                        }
                    }
                }
            }

            ret
        } else {
            false
        }
    }

    /// Gets whether there is live evidence that the device manager daemon is running.
    ///
    /// Downgrading the `"udev"` netlink group to [`None`](crate::UdevMonitorNetlinkGroup::None)
    /// is only correct when BOTH probes fail to find the daemon.
    pub fn daemon_is_active(&self) -> bool {
        self.has_udev_control_path() || self.has_devtmpfs()
    }
}
