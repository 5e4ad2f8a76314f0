//! The narrow device record the monitor sends and receives.
//!
//! This is not the device-database object (no syspath traversal, no hardware database lookups,
//! no device-node creation) — only the fields a monitor datagram actually carries.

use std::sync::Arc;

use crate::{Error, Result, Udev, UdevList};

/// A device event, as carried over the monitor socket.
#[derive(Clone, Debug, PartialEq)]
pub struct UdevDevice {
    udev: Arc<Udev>,
    subsystem: String,
    devtype: String,
    action: String,
    devpath: String,
    seqnum: u64,
    is_initialized: bool,
    properties_list: UdevList,
    tags_list: UdevList,
    monitor_buf: Vec<u8>,
}

impl UdevDevice {
    /// Creates a new, empty [UdevDevice].
    pub fn new(udev: Arc<Udev>) -> Self {
        let properties_list = UdevList::new(Arc::clone(&udev)).with_unique(true);
        let tags_list = UdevList::new(Arc::clone(&udev)).with_unique(true);

        Self {
            udev,
            subsystem: String::new(),
            devtype: String::new(),
            action: String::new(),
            devpath: String::new(),
            seqnum: 0,
            is_initialized: false,
            properties_list,
            tags_list,
            monitor_buf: Vec::new(),
        }
    }

    /// Builds a [UdevDevice] from a received NUL-separated `KEY=VALUE` properties blob.
    ///
    /// Dispatches each record through the same field-recognizing logic a sender's own
    /// `add_property_from_string_parse` would apply, so `subsystem`, `devtype`, `action`, and
    /// `tags_list` come back populated instead of sitting only in the raw properties list.
    pub fn new_from_nulstr(udev: Arc<Udev>, buf: &[u8]) -> Result<Self> {
        let mut device = Self::new(udev);

        for record in buf.split(|&b| b == 0) {
            if record.is_empty() {
                continue;
            }

            let line = std::str::from_utf8(record)
                .map_err(|e| Error::Again(format!("non-UTF8 property record: {e}")))?;

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            device.add_property_from_string_parse(key, value);
        }

        device.update_monitor_buf();

        Ok(device)
    }

    /// Adds a raw `KEY=VALUE` pair to the properties list without field recognition.
    pub fn add_property_from_string(&mut self, key: &str, value: &str) {
        self.properties_list.add_entry(key, value);
    }

    /// Adds a `KEY=VALUE` pair, additionally recognizing well-known keys and populating the
    /// corresponding typed field (`subsystem`, `devtype`, `action`, `devpath`, `seqnum`, tags).
    pub fn add_property_from_string_parse(&mut self, key: &str, value: &str) {
        match key {
            "SUBSYSTEM" => self.subsystem = value.to_owned(),
            "DEVTYPE" => self.devtype = value.to_owned(),
            "ACTION" => self.action = value.to_owned(),
            "DEVPATH" => self.devpath = value.to_owned(),
            "SEQNUM" => self.seqnum = value.parse().unwrap_or(0),
            "TAGS" => {
                for tag in value.split(':').filter(|t| !t.is_empty()) {
                    self.tags_list.add_entry(tag, "");
                }
            }
            _ => {}
        }

        self.add_property_from_string(key, value);
    }

    /// Gets the subsystem.
    pub fn subsystem(&self) -> &str {
        self.subsystem.as_str()
    }

    /// Sets the subsystem.
    pub fn set_subsystem<S: Into<String>>(&mut self, val: S) {
        self.subsystem = val.into();
    }

    /// Builder function that sets the subsystem.
    pub fn with_subsystem<S: Into<String>>(mut self, val: S) -> Self {
        self.set_subsystem(val);
        self
    }

    /// Gets the devtype.
    pub fn devtype(&self) -> &str {
        self.devtype.as_str()
    }

    /// Sets the devtype.
    pub fn set_devtype<S: Into<String>>(&mut self, val: S) {
        self.devtype = val.into();
    }

    /// Builder function that sets the devtype.
    pub fn with_devtype<S: Into<String>>(mut self, val: S) -> Self {
        self.set_devtype(val);
        self
    }

    /// Gets the action (e.g. `"add"`, `"remove"`, `"change"`).
    pub fn action(&self) -> &str {
        self.action.as_str()
    }

    /// Sets the action.
    pub fn set_action<S: Into<String>>(&mut self, val: S) {
        self.action = val.into();
    }

    /// Gets the device path.
    pub fn devpath(&self) -> &str {
        self.devpath.as_str()
    }

    /// Sets the device path.
    pub fn set_devpath<S: Into<String>>(&mut self, val: S) {
        self.devpath = val.into();
    }

    /// Gets the sequence number.
    pub const fn seqnum(&self) -> u64 {
        self.seqnum
    }

    /// Gets whether the device was received as a library-framed (already-processed) event.
    pub const fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    /// Sets whether the device is initialized.
    pub fn set_is_initialized(&mut self, val: bool) {
        self.is_initialized = val;
    }

    /// Gets a reference to the properties list.
    pub const fn properties_list(&self) -> &UdevList {
        &self.properties_list
    }

    /// Gets a mutable reference to the properties list.
    pub fn properties_list_mut(&mut self) -> &mut UdevList {
        &mut self.properties_list
    }

    /// Gets a reference to the tags list.
    pub const fn tags_list(&self) -> &UdevList {
        &self.tags_list
    }

    /// Gets a mutable reference to the tags list.
    pub fn tags_list_mut(&mut self) -> &mut UdevList {
        &mut self.tags_list
    }

    /// Adds a tag to the device.
    pub fn add_tag<S: AsRef<str>>(&mut self, tag: S) {
        self.tags_list.add_entry(tag.as_ref(), "");
    }

    /// Rebuilds the cached NUL-separated properties blob from the current properties list.
    ///
    /// Must be called (or `get_properties_monitor_buf` relied on to call it) after any mutation
    /// to the properties list that should be reflected in a subsequent send.
    pub fn update_monitor_buf(&mut self) {
        let mut buf = Vec::new();

        for entry in self.properties_list.iter() {
            buf.extend_from_slice(entry.name().as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(entry.value().as_bytes());
            buf.push(0);
        }

        self.monitor_buf = buf;
    }

    /// Gets the NUL-separated properties blob, rebuilding it if the properties list changed.
    pub fn get_properties_monitor_buf(&mut self) -> &[u8] {
        self.update_monitor_buf();
        self.monitor_buf.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udev() -> Arc<Udev> {
        Arc::new(Udev::new())
    }

    #[test]
    fn test_new_from_nulstr_parses_well_known_fields() {
        let buf = b"ACTION=add\0DEVPATH=/devices/pci0000:00/0000:00:02.0\0SUBSYSTEM=pci\0DEVTYPE=\0TAGS=foo:bar\0\0";
        let device = UdevDevice::new_from_nulstr(udev(), buf.as_ref()).unwrap();

        assert_eq!(device.action(), "add");
        assert_eq!(device.subsystem(), "pci");
        assert_eq!(device.devpath(), "/devices/pci0000:00/0000:00:02.0");
        assert!(device.tags_list().entry_by_name("foo").is_some());
        assert!(device.tags_list().entry_by_name("bar").is_some());
        assert!(!device.is_initialized());
    }

    #[test]
    fn test_new_from_nulstr_keeps_raw_properties() {
        let buf = b"SUBSYSTEM=net\0DEVPATH=/devices/virtual/net/lo\0\0";
        let device = UdevDevice::new_from_nulstr(udev(), buf.as_ref()).unwrap();

        assert_eq!(
            device.properties_list().entry_by_name("DEVPATH").unwrap().value(),
            "/devices/virtual/net/lo"
        );
    }

    #[test]
    fn test_monitor_buf_roundtrip() {
        let mut device = UdevDevice::new(udev());
        device.add_property_from_string("SUBSYSTEM", "block");
        device.add_property_from_string("DEVNAME", "/dev/sda");

        let buf = device.get_properties_monitor_buf().to_owned();
        let roundtripped = UdevDevice::new_from_nulstr(udev(), buf.as_ref()).unwrap();

        assert_eq!(roundtripped.subsystem(), "block");
        assert_eq!(
            roundtripped.properties_list().entry_by_name("DEVNAME").unwrap().value(),
            "/dev/sda"
        );
    }

    #[test]
    fn test_add_tag_idempotent() {
        let mut device = UdevDevice::new(udev());
        device.add_tag("foo");
        device.add_tag("foo");
        assert_eq!(device.tags_list().len(), 1);
    }
}
