//! Control-plane message layout.
//!
//! The daemon pairing one backend process per disk speaks fixed-layout
//! little-endian messages over a named-pipe pair: a common header carrying
//! `{type, length, drivertype, cookie}` followed by a type-specific body.
//! Only the codec lives here; the daemon itself is an external collaborator.

use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes as _, FromBytes as _};
use zerocopy_derive::{AsBytes, FromBytes, Unaligned};

type Le16 = U16<LittleEndian>;
type Le32 = U32<LittleEndian>;
type Le64 = U64<LittleEndian>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    Params = 1,
    Img = 2,
    ImgFail = 3,
    Newdev = 4,
    NewdevRsp = 5,
    NewdevFail = 6,
    Close = 7,
    CloseRsp = 8,
    Pid = 9,
    PidRsp = 10,
    Checkpoint = 11,
    CheckpointRsp = 12,
    Lock = 13,
    LockRsp = 14,
}

impl MsgType {
    pub fn from_raw(raw: u16) -> Option<MsgType> {
        Some(match raw {
            1 => MsgType::Params,
            2 => MsgType::Img,
            3 => MsgType::ImgFail,
            4 => MsgType::Newdev,
            5 => MsgType::NewdevRsp,
            6 => MsgType::NewdevFail,
            7 => MsgType::Close,
            8 => MsgType::CloseRsp,
            9 => MsgType::Pid,
            10 => MsgType::PidRsp,
            11 => MsgType::Checkpoint,
            12 => MsgType::CheckpointRsp,
            13 => MsgType::Lock,
            14 => MsgType::LockRsp,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct MsgHeader {
    pub ty: Le16,
    /// Total message length, header included.
    pub len: Le16,
    pub drivertype: u8,
    pub cookie: Le16,
}

impl MsgHeader {
    pub fn new(ty: MsgType, body_len: usize, drivertype: u8, cookie: u16) -> MsgHeader {
        MsgHeader {
            ty: Le16::new(ty as u16),
            len: Le16::new((std::mem::size_of::<MsgHeader>() + body_len) as u16),
            drivertype,
            cookie: Le16::new(cookie),
        }
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_raw(self.ty.get())
    }
}

/// Body of `Params`: open an image. The path follows at `path_off` from the
/// start of the message, `path_len` bytes including the NUL.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct MsgParams {
    pub readonly: u8,
    pub path_off: Le32,
    pub path_len: Le32,
}

/// Body of `Img`: the opened image's geometry.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct MsgImage {
    pub sectors: Le64,
    pub sector_size: Le32,
    pub info: Le32,
}

/// Body of `Newdev`/`NewdevRsp`: the minor to attach.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct MsgNewdev {
    pub devnum: Le32,
    pub domid: Le32,
}

/// Body of `Pid`/`PidRsp`.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct MsgPid {
    pub pid: Le32,
}

/// Body of `Lock`: enforce/readonly modes plus the lock identity and image
/// path trailing at the recorded offsets.
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct MsgLock {
    pub enforce: u8,
    pub readonly: u8,
    pub uuid_off: Le32,
    pub uuid_len: Le32,
    pub path_off: Le32,
    pub path_len: Le32,
}

/// Assemble a complete `Params` message.
pub fn encode_params(drivertype: u8, cookie: u16, readonly: bool, path: &str) -> Vec<u8> {
    let hdr_len = std::mem::size_of::<MsgHeader>();
    let body_len = std::mem::size_of::<MsgParams>();
    let path_off = hdr_len + body_len;
    let path_len = path.len() + 1;

    let header = MsgHeader::new(
        MsgType::Params,
        body_len + path_len,
        drivertype,
        cookie,
    );
    let body = MsgParams {
        readonly: readonly as u8,
        path_off: Le32::new(path_off as u32),
        path_len: Le32::new(path_len as u32),
    };

    let mut out = Vec::with_capacity(path_off + path_len);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(path.as_bytes());
    out.push(0);
    out
}

/// Split a received `Params` message into its body and path.
pub fn decode_params(msg: &[u8]) -> Option<(MsgHeader, bool, String)> {
    let hdr_len = std::mem::size_of::<MsgHeader>();
    let header = MsgHeader::read_from_prefix(msg)?;
    if header.msg_type()? != MsgType::Params || header.len.get() as usize != msg.len() {
        return None;
    }

    let body = MsgParams::read_from_prefix(&msg[hdr_len..])?;
    let off = body.path_off.get() as usize;
    let len = body.path_len.get() as usize;
    if len == 0 || off + len > msg.len() {
        return None;
    }

    let path = std::str::from_utf8(&msg[off..off + len - 1]).ok()?;
    Some((header, body.readonly != 0, path.to_owned()))
}

pub fn encode_simple(ty: MsgType, drivertype: u8, cookie: u16) -> Vec<u8> {
    MsgHeader::new(ty, 0, drivertype, cookie).as_bytes().to_vec()
}

pub fn encode_image(drivertype: u8, cookie: u16, sectors: u64, sector_size: u32, info: u32) -> Vec<u8> {
    let header = MsgHeader::new(
        MsgType::Img,
        std::mem::size_of::<MsgImage>(),
        drivertype,
        cookie,
    );
    let body = MsgImage {
        sectors: Le64::new(sectors),
        sector_size: Le32::new(sector_size),
        info: Le32::new(info),
    };

    let mut out = Vec::new();
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body.as_bytes());
    out
}

pub fn decode_image(msg: &[u8]) -> Option<(MsgHeader, MsgImage)> {
    let hdr_len = std::mem::size_of::<MsgHeader>();
    let header = MsgHeader::read_from_prefix(msg)?;
    if header.msg_type()? != MsgType::Img {
        return None;
    }
    let body = MsgImage::read_from_prefix(&msg[hdr_len..])?;
    Some((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_seven_packed_bytes() {
        assert_eq!(std::mem::size_of::<MsgHeader>(), 7);
    }

    #[test]
    fn params_round_trip() {
        let msg = encode_params(4, 0xbeef, true, "/images/disk.vhd");
        let (header, readonly, path) = decode_params(&msg).unwrap();

        assert_eq!(header.msg_type(), Some(MsgType::Params));
        assert_eq!(header.drivertype, 4);
        assert_eq!(header.cookie.get(), 0xbeef);
        assert_eq!(header.len.get() as usize, msg.len());
        assert!(readonly);
        assert_eq!(path, "/images/disk.vhd");
    }

    #[test]
    fn image_round_trip() {
        let msg = encode_image(4, 7, 16384, 512, 0);
        let (header, body) = decode_image(&msg).unwrap();
        assert_eq!(header.msg_type(), Some(MsgType::Img));
        assert_eq!(body.sectors.get(), 16384);
        assert_eq!(body.sector_size.get(), 512);
    }

    #[test]
    fn truncated_messages_are_rejected() {
        let msg = encode_params(4, 1, false, "/x.vhd");
        assert!(decode_params(&msg[..5]).is_none());
        assert!(decode_params(&msg[..msg.len() - 1]).is_none());
    }

    #[test]
    fn integers_are_little_endian_on_the_wire() {
        let msg = encode_simple(MsgType::Close, 2, 0x0102);
        assert_eq!(msg[0], 7); // type low byte first
        assert_eq!(msg[1], 0);
        assert_eq!(msg[5], 0x02); // cookie
        assert_eq!(msg[6], 0x01);
    }
}
