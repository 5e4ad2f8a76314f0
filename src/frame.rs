//! Wire framing: the library-framed datagram header, and kernel-framed datagram detection.
//!
//! Split out from the monitor so the codec can be exercised without a socket.

use std::mem;

use crate::{Error, Result};

/// Magic constant identifying a library-framed datagram, stored NET-ORDER on the wire.
pub const UDEV_MONITOR_MAGIC: u32 = 0xfeed_cafe;
/// Prefix byte string that precedes a library-framed header.
pub const UDEV_MONITOR_PREFIX: [u8; 8] = [b'l', b'i', b'b', b'u', b'd', b'e', b'v', 0];
/// Length in bytes of the fixed [NetlinkHeader].
pub const HEADER_LEN: usize = 40;

/// The fixed-layout header prefixing a library-framed datagram.
///
/// Encoded/decoded field-by-field rather than reinterpreted as raw bytes: the `magic` and
/// `filter_*` fields are stored NET-ORDER (matching what the BPF `BPF_ABS` loads expect), while
/// `header_size`/`properties_off`/`properties_len` are plain host-order since the kernel filter
/// never inspects them.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NetlinkHeader {
    pub header_size: u32,
    pub properties_off: u32,
    pub properties_len: u32,
    pub filter_subsystem_hash: u32,
    pub filter_devtype_hash: u32,
    pub filter_tag_bloom_hi: u32,
    pub filter_tag_bloom_lo: u32,
}

impl NetlinkHeader {
    /// Creates a new, zeroed [NetlinkHeader] with `header_size` set to the on-wire length.
    pub const fn new() -> Self {
        Self {
            header_size: HEADER_LEN as u32,
            properties_off: 0,
            properties_len: 0,
            filter_subsystem_hash: 0,
            filter_devtype_hash: 0,
            filter_tag_bloom_hi: 0,
            filter_tag_bloom_lo: 0,
        }
    }

    /// `magic` field offset, as consumed by the BPF magic gate.
    pub const fn magic_offset() -> usize {
        8
    }

    /// `filter_subsystem_hash` field offset.
    pub const fn filter_subsystem_hash_offset() -> usize {
        24
    }

    /// `filter_devtype_hash` field offset.
    pub const fn filter_devtype_hash_offset() -> usize {
        28
    }

    /// `filter_tag_bloom_hi` field offset.
    pub const fn filter_tag_bloom_hi_offset() -> usize {
        32
    }

    /// `filter_tag_bloom_lo` field offset.
    pub const fn filter_tag_bloom_lo_offset() -> usize {
        36
    }

    /// Encodes the header into its 40-byte wire representation.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];

        buf[0..8].copy_from_slice(&UDEV_MONITOR_PREFIX);
        buf[8..12].copy_from_slice(&UDEV_MONITOR_MAGIC.to_be_bytes());
        buf[12..16].copy_from_slice(&self.header_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.properties_off.to_le_bytes());
        buf[20..24].copy_from_slice(&self.properties_len.to_le_bytes());
        buf[24..28].copy_from_slice(&self.filter_subsystem_hash.to_be_bytes());
        buf[28..32].copy_from_slice(&self.filter_devtype_hash.to_be_bytes());
        buf[32..36].copy_from_slice(&self.filter_tag_bloom_hi.to_be_bytes());
        buf[36..40].copy_from_slice(&self.filter_tag_bloom_lo.to_be_bytes());

        buf
    }

    /// Decodes a header from `buf`, validating the prefix and magic constant.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Again(format!(
                "short library-framed header: {} bytes, expected at least {HEADER_LEN}",
                buf.len()
            )));
        }

        if buf[0..8] != UDEV_MONITOR_PREFIX {
            return Err(Error::Again(
                "invalid monitor netlink prefix, expected 'libudev'".into(),
            ));
        }

        let magic = u32::from_be_bytes(buf[8..12].try_into()?);
        if magic != UDEV_MONITOR_MAGIC {
            return Err(Error::Again(format!(
                "magic mismatch: expected {UDEV_MONITOR_MAGIC:#x}, have {magic:#x}"
            )));
        }

        Ok(Self {
            header_size: u32::from_le_bytes(buf[12..16].try_into()?),
            properties_off: u32::from_le_bytes(buf[16..20].try_into()?),
            properties_len: u32::from_le_bytes(buf[20..24].try_into()?),
            filter_subsystem_hash: u32::from_be_bytes(buf[24..28].try_into()?),
            filter_devtype_hash: u32::from_be_bytes(buf[28..32].try_into()?),
            filter_tag_bloom_hi: u32::from_be_bytes(buf[32..36].try_into()?),
            filter_tag_bloom_lo: u32::from_be_bytes(buf[36..40].try_into()?),
        })
    }
}

/// The result of classifying a received datagram by its leading bytes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DecodedFrame {
    /// A library-framed datagram: properties begin at `properties_off`.
    Library { properties_off: usize },
    /// A kernel-framed datagram (`ACTION@DEVPATH\0...`): properties begin at `header_len`.
    Kernel { header_len: usize },
}

/// Classifies a received datagram and locates where its properties blob begins.
///
/// `buflen` is the number of bytes actually received (`buf` itself may be a larger, zero-padded
/// stack buffer).
pub fn decode_frame(buf: &[u8], buflen: usize) -> Result<DecodedFrame> {
    const MIN_MESSAGE_LEN: usize = 32;

    if buflen < MIN_MESSAGE_LEN {
        return Err(Error::Again(format!("invalid message length: {buflen}")));
    }

    if buf.len() >= 8 && buf[0..8] == UDEV_MONITOR_PREFIX {
        let header = NetlinkHeader::decode(buf)?;
        let off = header.properties_off as usize;

        if off.saturating_add(32) > buflen {
            return Err(Error::Again(format!(
                "invalid properties offset: {off}, message length {buflen}"
            )));
        }

        return Ok(DecodedFrame::Library { properties_off: off });
    }

    // kernel message: "ACTION@DEVPATH\0" followed by the properties blob.
    let header_len = buf
        .iter()
        .position(|&b| b == 0)
        .map(|pos| pos + 1)
        .unwrap_or(0);

    // matches C's `sizeof("a@/d")`, which counts the terminating NUL.
    const MIN_KERNEL_HEADER_LEN: usize = b"a@/d\0".len();

    if header_len < MIN_KERNEL_HEADER_LEN || header_len >= buflen {
        return Err(Error::Again(format!(
            "invalid message length: buffer length {buflen}, header length {header_len}, expected at least {MIN_KERNEL_HEADER_LEN}"
        )));
    }

    if !buf[..header_len].windows(2).any(|w| w == b"@/") {
        return Err(Error::Again("unrecognized message header".into()));
    }

    Ok(DecodedFrame::Kernel { header_len })
}

const _: () = assert!(mem::size_of::<u32>() == 4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = NetlinkHeader {
            header_size: HEADER_LEN as u32,
            properties_off: HEADER_LEN as u32,
            properties_len: 12,
            filter_subsystem_hash: 0xdead_beef,
            filter_devtype_hash: 0x1234_5678,
            filter_tag_bloom_hi: 0x0000_0001,
            filter_tag_bloom_lo: 0x8000_0000,
        };

        let encoded = header.encode();
        let decoded = NetlinkHeader::decode(&encoded).unwrap();

        assert_eq!(decoded, header);
    }

    #[test]
    fn test_magic_is_stored_net_order() {
        let header = NetlinkHeader::new();
        let encoded = header.encode();
        // NET-ORDER (big-endian) encoding of 0xfeedcafe.
        assert_eq!(&encoded[8..12], &[0xfe, 0xed, 0xca, 0xfe]);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut encoded = NetlinkHeader::new().encode();
        encoded[8] = 0x00;
        assert!(NetlinkHeader::decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_frame_library() {
        // the received length must cover at least 32 bytes past `properties_off`, even though
        // the actual properties blob here is much shorter.
        let mut buf = vec![0u8; HEADER_LEN + 32];
        let header = NetlinkHeader {
            properties_off: HEADER_LEN as u32,
            properties_len: 16,
            ..NetlinkHeader::new()
        };
        buf[..HEADER_LEN].copy_from_slice(&header.encode());

        let buflen = buf.len();
        match decode_frame(&buf, buflen).unwrap() {
            DecodedFrame::Library { properties_off } => assert_eq!(properties_off, HEADER_LEN),
            other => panic!("expected Library, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_frame_rejects_short_properties_region() {
        let mut buf = vec![0u8; HEADER_LEN + 16];
        let header = NetlinkHeader {
            properties_off: HEADER_LEN as u32,
            properties_len: 16,
            ..NetlinkHeader::new()
        };
        buf[..HEADER_LEN].copy_from_slice(&header.encode());

        let buflen = buf.len();
        assert!(decode_frame(&buf, buflen).is_err());
    }

    #[test]
    fn test_decode_frame_kernel() {
        let mut buf = b"add@/devices/pci0000:00/0000:00:02.0\0".to_vec();
        buf.extend_from_slice(b"ACTION=add\0SUBSYSTEM=pci\0\0");

        let buflen = buf.len();
        match decode_frame(&buf, buflen).unwrap() {
            DecodedFrame::Kernel { header_len } => {
                assert_eq!(header_len, "add@/devices/pci0000:00/0000:00:02.0\0".len())
            }
            other => panic!("expected Kernel, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_frame_kernel_accepts_message_shorter_than_library_header() {
        // 33 bytes total: shorter than the 40-byte library-framed header, but still above the
        // universal 32-byte floor, so a kernel-framed datagram this short must still decode.
        let mut buf = b"a@/d\0".to_vec();
        buf.extend_from_slice(&[b'X'; 28]);
        assert_eq!(buf.len(), 33);

        let buflen = buf.len();
        match decode_frame(&buf, buflen).unwrap() {
            DecodedFrame::Kernel { header_len } => assert_eq!(header_len, 5),
            other => panic!("expected Kernel, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_frame_rejects_short_buffer() {
        let buf = b"short\0";
        assert!(decode_frame(buf.as_ref(), buf.len()).is_err());
    }

    #[test]
    fn test_decode_frame_rejects_missing_devpath_separator() {
        let mut buf = b"noseparatorhere\0".to_vec();
        buf.extend_from_slice(&[0u8; 32]);
        let buflen = buf.len();
        assert!(decode_frame(&buf, buflen).is_err());
    }
}
