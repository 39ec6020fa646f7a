//! Private wire format: size-prefixed headers, opcode numbering, and
//! correlation helpers.
//!
//! Every message starts with a fixed 24-byte little-endian header:
//!
//! ```text
//! offset  size  field
//!      0     4  total frame length, including this header
//!      4     2  operation class
//!      6     2  opcode within the class
//!      8     4  flags (reply-wanted, response)
//!     12     4  status (0 in requests, errno in replies)
//!     16     8  correlation id
//! ```
//!
//! A class-specific fixed argument block follows, then an optional
//! variable trailer (bulk read/write payloads, directory listings).
//! The numbering is private to this engine; peers speak it only through
//! both ends linking this crate.

use crate::dispatch::SetAttr;
use crate::error::DispatchError;
use crate::registry::{NodeAttr, NodeKind};
use crate::transport::Frame;

/// Size of the fixed wire header in bytes.
pub const HEADER_LEN: usize = 24;

/// Flag bit: the sender expects a reply to this request.
pub const FLAG_REPLY_WANTED: u32 = 0x1;
/// Flag bit: this frame is a reply, not a request.
pub const FLAG_RESPONSE: u32 = 0x2;

// =============================================================================
// Operation classes and opcodes
// =============================================================================

/// Top-level operation class carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OpClass {
    /// Mount-level operations.
    Structural = 0,
    /// Per-object operations addressed by cookie.
    Node = 1,
    /// Out-of-band error report from the peer.
    PeerError = 2,
}

impl TryFrom<u16> for OpClass {
    type Error = DispatchError;

    fn try_from(v: u16) -> Result<Self, DispatchError> {
        match v {
            0 => Ok(OpClass::Structural),
            1 => Ok(OpClass::Node),
            2 => Ok(OpClass::PeerError),
            other => Err(DispatchError::UnknownOpcode {
                class: other,
                opcode: 0,
            }),
        }
    }
}

/// Mount-level opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StructuralOp {
    Unmount = 0,
    Statfs = 1,
    Sync = 2,
    HandleToNode = 3,
    NodeToHandle = 4,
    ExtattrCtl = 5,
}

impl TryFrom<u16> for StructuralOp {
    type Error = DispatchError;

    fn try_from(v: u16) -> Result<Self, DispatchError> {
        match v {
            0 => Ok(StructuralOp::Unmount),
            1 => Ok(StructuralOp::Statfs),
            2 => Ok(StructuralOp::Sync),
            3 => Ok(StructuralOp::HandleToNode),
            4 => Ok(StructuralOp::NodeToHandle),
            5 => Ok(StructuralOp::ExtattrCtl),
            other => Err(DispatchError::UnknownOpcode {
                class: OpClass::Structural as u16,
                opcode: other,
            }),
        }
    }
}

/// Per-object opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NodeOp {
    Lookup = 0,
    Create = 1,
    Mknod = 2,
    Open = 3,
    Close = 4,
    Getattr = 5,
    Setattr = 6,
    Access = 7,
    Read = 8,
    Write = 9,
    Fsync = 10,
    Link = 11,
    Unlink = 12,
    Rename = 13,
    Mkdir = 14,
    Rmdir = 15,
    Symlink = 16,
    Readlink = 17,
    Readdir = 18,
    GetXattr = 19,
    SetXattr = 20,
    ListXattr = 21,
    RemoveXattr = 22,
    Fallocate = 23,
    Fdiscard = 24,
    Reclaim = 25,
}

impl TryFrom<u16> for NodeOp {
    type Error = DispatchError;

    fn try_from(v: u16) -> Result<Self, DispatchError> {
        use NodeOp::*;
        let op = match v {
            0 => Lookup,
            1 => Create,
            2 => Mknod,
            3 => Open,
            4 => Close,
            5 => Getattr,
            6 => Setattr,
            7 => Access,
            8 => Read,
            9 => Write,
            10 => Fsync,
            11 => Link,
            12 => Unlink,
            13 => Rename,
            14 => Mkdir,
            15 => Rmdir,
            16 => Symlink,
            17 => Readlink,
            18 => Readdir,
            19 => GetXattr,
            20 => SetXattr,
            21 => ListXattr,
            22 => RemoveXattr,
            23 => Fallocate,
            24 => Fdiscard,
            25 => Reclaim,
            other => {
                return Err(DispatchError::UnknownOpcode {
                    class: OpClass::Node as u16,
                    opcode: other,
                })
            }
        };
        Ok(op)
    }
}

// =============================================================================
// Header
// =============================================================================

/// Decoded wire header.
#[derive(Debug, Clone, Copy)]
pub struct WireHeader {
    /// Operation class.
    pub class: OpClass,
    /// Raw opcode within the class.
    pub opcode: u16,
    /// Flag bits.
    pub flags: u32,
    /// Reply status; zero in requests.
    pub status: i32,
    /// Correlation id linking a reply to its request.
    pub request_id: u64,
}

impl WireHeader {
    /// Returns whether the peer wants a reply.
    pub fn reply_wanted(&self) -> bool {
        self.flags & FLAG_REPLY_WANTED != 0
    }

    /// Returns whether this frame is a reply.
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    /// Decodes and validates the header of an inbound frame.
    ///
    /// The length field must match the frame's actual byte count; a
    /// mismatch means framing corruption and fails the current request.
    pub fn decode(frame: &Frame) -> Result<Self, DispatchError> {
        if frame.len() < HEADER_LEN {
            return Err(DispatchError::Malformed(format!(
                "frame of {} bytes is shorter than the {} byte header",
                frame.len(),
                HEADER_LEN
            )));
        }
        let declared = frame.get_u32_at(0)? as usize;
        if declared != frame.len() {
            return Err(DispatchError::Malformed(format!(
                "declared length {} does not match {} received bytes",
                declared,
                frame.len()
            )));
        }

        let mut class_raw = [0u8; 2];
        frame.get_at(4, &mut class_raw)?;
        let mut opcode_raw = [0u8; 2];
        frame.get_at(6, &mut opcode_raw)?;

        Ok(Self {
            class: OpClass::try_from(u16::from_le_bytes(class_raw))?,
            opcode: u16::from_le_bytes(opcode_raw),
            flags: frame.get_u32_at(8)?,
            status: frame.get_i32_at(12)?,
            request_id: frame.get_u64_at(16)?,
        })
    }
}

/// Lays down a request header and positions the cursor for arguments.
///
/// The length field is written by [`finalize`] once the body is complete.
pub fn begin_request(
    frame: &mut Frame,
    class: OpClass,
    opcode: u16,
    request_id: u64,
    want_reply: bool,
) -> Result<(), DispatchError> {
    let flags = if want_reply { FLAG_REPLY_WANTED } else { 0 };
    frame.put_u32_at(0, 0)?;
    frame.put_at(4, &(class as u16).to_le_bytes())?;
    frame.put_at(6, &opcode.to_le_bytes())?;
    frame.put_at(8, &flags.to_le_bytes())?;
    frame.put_i32_at(12, 0)?;
    frame.put_at(16, &request_id.to_le_bytes())?;
    frame.seek(HEADER_LEN);
    Ok(())
}

/// Lays down a reply header echoing a request's correlation id.
pub fn begin_reply(
    frame: &mut Frame,
    request: &WireHeader,
    status: i32,
) -> Result<(), DispatchError> {
    frame.put_u32_at(0, 0)?;
    frame.put_at(4, &(request.class as u16).to_le_bytes())?;
    frame.put_at(6, &request.opcode.to_le_bytes())?;
    frame.put_at(8, &FLAG_RESPONSE.to_le_bytes())?;
    frame.put_i32_at(12, status)?;
    frame.put_at(16, &request.request_id.to_le_bytes())?;
    frame.seek(HEADER_LEN);
    Ok(())
}

/// Patches the length field with the frame's final size.
///
/// Must be the last step before enqueueing the frame for send.
pub fn finalize(frame: &mut Frame) -> Result<(), DispatchError> {
    let len = frame.len() as u32;
    frame.put_u32_at(0, len)?;
    Ok(())
}

/// Reads the correlation id without decoding the full header.
///
/// Returns `None` for frames too short to carry one.
pub fn peek_request_id(frame: &Frame) -> Option<u64> {
    frame.get_u64_at(16).ok()
}

/// Returns whether a frame carries the response flag.
pub fn peek_is_response(frame: &Frame) -> bool {
    frame
        .get_u32_at(8)
        .map(|flags| flags & FLAG_RESPONSE != 0)
        .unwrap_or(false)
}

// =============================================================================
// Attribute and dirent encoding
// =============================================================================

/// Writes a node attribute block at the cursor.
pub fn put_attr(frame: &mut Frame, attr: &NodeAttr) -> Result<(), DispatchError> {
    frame.put_u8(attr.kind as u8)?;
    frame.put_u32(attr.mode)?;
    frame.put_u32(attr.nlink)?;
    frame.put_u32(attr.uid)?;
    frame.put_u32(attr.gid)?;
    frame.put_u64(attr.size)?;
    frame.put_u64(attr.mtime_secs)?;
    Ok(())
}

/// Reads a node attribute block at the cursor.
pub fn get_attr(frame: &mut Frame) -> Result<NodeAttr, DispatchError> {
    let kind = NodeKind::from_raw(frame.get_u8()?);
    Ok(NodeAttr {
        kind,
        mode: frame.get_u32()?,
        nlink: frame.get_u32()?,
        uid: frame.get_u32()?,
        gid: frame.get_u32()?,
        size: frame.get_u64()?,
        mtime_secs: frame.get_u64()?,
    })
}

/// Writes a setattr change block: a presence mask, then only the
/// present fields in mask-bit order.
pub fn put_setattr(frame: &mut Frame, set: &SetAttr) -> Result<(), DispatchError> {
    let mut mask = 0u8;
    if set.mode.is_some() {
        mask |= 0x01;
    }
    if set.uid.is_some() {
        mask |= 0x02;
    }
    if set.gid.is_some() {
        mask |= 0x04;
    }
    if set.size.is_some() {
        mask |= 0x08;
    }
    if set.mtime_secs.is_some() {
        mask |= 0x10;
    }
    frame.put_u8(mask)?;
    if let Some(v) = set.mode {
        frame.put_u32(v)?;
    }
    if let Some(v) = set.uid {
        frame.put_u32(v)?;
    }
    if let Some(v) = set.gid {
        frame.put_u32(v)?;
    }
    if let Some(v) = set.size {
        frame.put_u64(v)?;
    }
    if let Some(v) = set.mtime_secs {
        frame.put_u64(v)?;
    }
    Ok(())
}

/// Reads a setattr change block at the cursor.
pub fn get_setattr(frame: &mut Frame) -> Result<SetAttr, DispatchError> {
    let mask = frame.get_u8()?;
    let mut set = SetAttr::default();
    if mask & 0x01 != 0 {
        set.mode = Some(frame.get_u32()?);
    }
    if mask & 0x02 != 0 {
        set.uid = Some(frame.get_u32()?);
    }
    if mask & 0x04 != 0 {
        set.gid = Some(frame.get_u32()?);
    }
    if mask & 0x08 != 0 {
        set.size = Some(frame.get_u64()?);
    }
    if mask & 0x10 != 0 {
        set.mtime_secs = Some(frame.get_u64()?);
    }
    Ok(set)
}

/// Appends one directory entry to a listing trailer.
pub fn put_dirent(
    frame: &mut Frame,
    cookie: u64,
    kind: NodeKind,
    name: &[u8],
) -> Result<(), DispatchError> {
    frame.put_u64(cookie)?;
    frame.put_u8(kind as u8)?;
    frame.put_bytes(name)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut frame = Frame::new();
        begin_request(&mut frame, OpClass::Node, NodeOp::Lookup as u16, 42, true).unwrap();
        frame.put_u64(7).unwrap();
        finalize(&mut frame).unwrap();

        let hdr = WireHeader::decode(&frame).unwrap();
        assert_eq!(hdr.class, OpClass::Node);
        assert_eq!(hdr.opcode, NodeOp::Lookup as u16);
        assert_eq!(hdr.request_id, 42);
        assert!(hdr.reply_wanted());
        assert!(!hdr.is_response());
    }

    #[test]
    fn test_reply_echoes_correlation_id() {
        let mut request = Frame::new();
        begin_request(&mut request, OpClass::Node, NodeOp::Getattr as u16, 99, true).unwrap();
        finalize(&mut request).unwrap();
        let req_hdr = WireHeader::decode(&request).unwrap();

        let mut reply = Frame::new();
        begin_reply(&mut reply, &req_hdr, libc::ENOENT).unwrap();
        finalize(&mut reply).unwrap();

        let hdr = WireHeader::decode(&reply).unwrap();
        assert!(hdr.is_response());
        assert_eq!(hdr.request_id, 99);
        assert_eq!(hdr.status, libc::ENOENT);
        assert_eq!(peek_request_id(&reply), Some(99));
        assert!(peek_is_response(&reply));
    }

    #[test]
    fn test_length_mismatch_is_malformed() {
        let mut frame = Frame::new();
        begin_request(&mut frame, OpClass::Structural, 0, 1, false).unwrap();
        finalize(&mut frame).unwrap();
        // Corrupt the declared length
        frame.put_u32_at(0, 9999).unwrap();

        let err = WireHeader::decode(&frame).unwrap_err();
        assert!(matches!(err, DispatchError::Malformed(_)));
    }

    #[test]
    fn test_unknown_class_rejected() {
        let mut frame = Frame::new();
        begin_request(&mut frame, OpClass::Node, 0, 1, false).unwrap();
        frame.put_at(4, &77u16.to_le_bytes()).unwrap();
        finalize(&mut frame).unwrap();

        assert!(WireHeader::decode(&frame).is_err());
    }

    #[test]
    fn test_node_opcode_numbering_is_closed() {
        assert!(NodeOp::try_from(25).is_ok());
        assert!(NodeOp::try_from(26).is_err());
        assert!(StructuralOp::try_from(6).is_err());
    }

    #[test]
    fn test_setattr_mask_carries_only_present_fields() {
        let set = SetAttr {
            mode: Some(0o644),
            size: Some(100),
            ..SetAttr::default()
        };

        let mut frame = Frame::new();
        put_setattr(&mut frame, &set).unwrap();
        // mask + u32 mode + u64 size
        assert_eq!(frame.len(), 1 + 4 + 8);

        frame.rewind();
        let decoded = get_setattr(&mut frame).unwrap();
        assert_eq!(decoded.mode, Some(0o644));
        assert_eq!(decoded.size, Some(100));
        assert_eq!(decoded.uid, None);
        assert_eq!(decoded.mtime_secs, None);
    }

    #[test]
    fn test_attr_roundtrip() {
        let attr = NodeAttr {
            kind: NodeKind::Dir,
            mode: 0o755,
            nlink: 2,
            uid: 1000,
            gid: 1000,
            size: 4096,
            mtime_secs: 1_700_000_000,
        };

        let mut frame = Frame::new();
        put_attr(&mut frame, &attr).unwrap();
        frame.rewind();
        let decoded = get_attr(&mut frame).unwrap();
        assert_eq!(decoded.kind, NodeKind::Dir);
        assert_eq!(decoded.mode, 0o755);
        assert_eq!(decoded.size, 4096);
    }
}
