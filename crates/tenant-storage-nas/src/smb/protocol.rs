//! SMB2 message encoding and parsing (client side).
//!
//! Only the dialects 2.0.2 and 2.1 are spoken. Every message travels over
//! direct TCP (port 445) behind a 4-byte session header.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};

use super::error::{NtStatus, SmbError, SmbResult};

/// SMB2 protocol ID
pub const SMB2_PROTOCOL_ID: &[u8; 4] = b"\xFESMB";

/// SMB2 header size
pub const SMB2_HEADER_SIZE: usize = 64;

pub const DIALECT_SMB_2_0_2: u16 = 0x0202;
pub const DIALECT_SMB_2_1: u16 = 0x0210;

/// Largest frame accepted from the server.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// 100ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_OFFSET: i64 = 116_444_736_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SmbCommand {
    Negotiate = 0x0000,
    SessionSetup = 0x0001,
    Logoff = 0x0002,
    TreeConnect = 0x0003,
    TreeDisconnect = 0x0004,
    Create = 0x0005,
    Close = 0x0006,
    Flush = 0x0007,
    Read = 0x0008,
    Write = 0x0009,
    Lock = 0x000A,
    Ioctl = 0x000B,
    Cancel = 0x000C,
    Echo = 0x000D,
    QueryDirectory = 0x000E,
    ChangeNotify = 0x000F,
    QueryInfo = 0x0010,
    SetInfo = 0x0011,
    OplockBreak = 0x0012,
}

impl TryFrom<u16> for SmbCommand {
    type Error = SmbError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Self::Negotiate),
            0x0001 => Ok(Self::SessionSetup),
            0x0002 => Ok(Self::Logoff),
            0x0003 => Ok(Self::TreeConnect),
            0x0004 => Ok(Self::TreeDisconnect),
            0x0005 => Ok(Self::Create),
            0x0006 => Ok(Self::Close),
            0x0007 => Ok(Self::Flush),
            0x0008 => Ok(Self::Read),
            0x0009 => Ok(Self::Write),
            0x000A => Ok(Self::Lock),
            0x000B => Ok(Self::Ioctl),
            0x000C => Ok(Self::Cancel),
            0x000D => Ok(Self::Echo),
            0x000E => Ok(Self::QueryDirectory),
            0x000F => Ok(Self::ChangeNotify),
            0x0010 => Ok(Self::QueryInfo),
            0x0011 => Ok(Self::SetInfo),
            0x0012 => Ok(Self::OplockBreak),
            other => Err(SmbError::Protocol(format!("Unknown SMB2 command 0x{:04X}", other))),
        }
    }
}

/// SMB2 header flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Smb2Flags(u32);

impl Smb2Flags {
    pub const RESPONSE: u32 = 0x0000_0001;
    pub const ASYNC_COMMAND: u32 = 0x0000_0002;
    pub const RELATED_OPERATIONS: u32 = 0x0000_0004;
    pub const SIGNED: u32 = 0x0000_0008;

    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_response(&self) -> bool {
        self.0 & Self::RESPONSE != 0
    }

    pub fn is_async(&self) -> bool {
        self.0 & Self::ASYNC_COMMAND != 0
    }

    pub fn is_signed(&self) -> bool {
        self.0 & Self::SIGNED != 0
    }

    pub fn set_signed(&mut self) {
        self.0 |= Self::SIGNED;
    }
}

/// Security mode bits of NEGOTIATE and SESSION_SETUP.
pub struct SecurityMode;

impl SecurityMode {
    pub const SIGNING_ENABLED: u16 = 0x0001;
    pub const SIGNING_REQUIRED: u16 = 0x0002;
}

/// SESSION_SETUP response flags.
pub struct SessionFlags;

impl SessionFlags {
    pub const IS_GUEST: u16 = 0x0001;
    pub const IS_NULL: u16 = 0x0002;
}

/// SMB2 header
#[derive(Debug, Clone)]
pub struct Smb2Header {
    pub credit_charge: u16,
    pub status: NtStatus,
    pub command: SmbCommand,
    pub credit: u16,
    pub flags: Smb2Flags,
    pub next_command: u32,
    pub message_id: u64,
    pub async_id: u64,
    pub session_id: u64,
    pub signature: [u8; 16],
    pub tree_id: u32,
}

impl Smb2Header {
    pub fn new_request(command: SmbCommand, message_id: u64, session_id: u64, tree_id: u32) -> Self {
        Self {
            credit_charge: 1,
            status: NtStatus::SUCCESS,
            command,
            credit: 32,
            flags: Smb2Flags::default(),
            next_command: 0,
            message_id,
            async_id: 0,
            session_id,
            signature: [0; 16],
            tree_id,
        }
    }

    pub fn parse(data: &[u8]) -> SmbResult<Self> {
        if data.len() < SMB2_HEADER_SIZE {
            return Err(SmbError::Protocol("Header too short".to_string()));
        }
        if &data[0..4] != SMB2_PROTOCOL_ID {
            return Err(SmbError::Protocol("Invalid SMB2 protocol ID".to_string()));
        }

        let mut buf = &data[4..SMB2_HEADER_SIZE];
        let structure_size = buf.get_u16_le();
        if structure_size != 64 {
            return Err(SmbError::Protocol(format!(
                "Unexpected header structure size {}",
                structure_size
            )));
        }
        let credit_charge = buf.get_u16_le();
        let status = NtStatus::from_u32(buf.get_u32_le());
        let command = SmbCommand::try_from(buf.get_u16_le())?;
        let credit = buf.get_u16_le();
        let flags = Smb2Flags::new(buf.get_u32_le());
        let next_command = buf.get_u32_le();
        let message_id = buf.get_u64_le();

        let (async_id, tree_id) = if flags.is_async() {
            (buf.get_u64_le(), 0)
        } else {
            let _reserved = buf.get_u32_le();
            (0, buf.get_u32_le())
        };

        let session_id = buf.get_u64_le();
        let mut signature = [0u8; 16];
        buf.copy_to_slice(&mut signature);

        Ok(Self {
            credit_charge,
            status,
            command,
            credit,
            flags,
            next_command,
            message_id,
            async_id,
            session_id,
            signature,
            tree_id,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(SMB2_PROTOCOL_ID);
        buf.put_u16_le(64);
        buf.put_u16_le(self.credit_charge);
        buf.put_u32_le(self.status.as_u32());
        buf.put_u16_le(self.command as u16);
        buf.put_u16_le(self.credit);
        buf.put_u32_le(self.flags.bits());
        buf.put_u32_le(self.next_command);
        buf.put_u64_le(self.message_id);

        if self.flags.is_async() {
            buf.put_u64_le(self.async_id);
        } else {
            buf.put_u32_le(0); // Reserved
            buf.put_u32_le(self.tree_id);
        }

        buf.put_u64_le(self.session_id);
        buf.put_slice(&self.signature);
    }
}

/// File ID (SMB2 persistent + volatile)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub persistent: u64,
    pub volatile: u64,
}

impl FileId {
    pub fn parse(buf: &mut &[u8]) -> Self {
        let persistent = buf.get_u64_le();
        let volatile = buf.get_u64_le();
        Self {
            persistent,
            volatile,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.persistent);
        buf.put_u64_le(self.volatile);
    }
}

/// Create disposition (how to handle an existing file)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CreateDisposition {
    Supersede = 0,
    /// If exists, open. If not exists, fail.
    Open = 1,
    /// If exists, fail. If not exists, create.
    Create = 2,
    /// If exists, open. If not exists, create.
    OpenIf = 3,
    /// If exists, overwrite. If not exists, fail.
    Overwrite = 4,
    /// If exists, overwrite. If not exists, create.
    OverwriteIf = 5,
}

pub struct DesiredAccess;

impl DesiredAccess {
    pub const FILE_READ_DATA: u32 = 0x0000_0001;
    pub const FILE_WRITE_DATA: u32 = 0x0000_0002;
    pub const FILE_LIST_DIRECTORY: u32 = 0x0000_0001;
    pub const FILE_READ_ATTRIBUTES: u32 = 0x0000_0080;
    pub const DELETE: u32 = 0x0001_0000;
    pub const SYNCHRONIZE: u32 = 0x0010_0000;
    pub const MAXIMUM_ALLOWED: u32 = 0x0200_0000;
    pub const GENERIC_WRITE: u32 = 0x4000_0000;
    pub const GENERIC_READ: u32 = 0x8000_0000;
}

pub struct ShareAccess;

impl ShareAccess {
    pub const READ: u32 = 0x0000_0001;
    pub const WRITE: u32 = 0x0000_0002;
    pub const DELETE: u32 = 0x0000_0004;
    pub const ALL: u32 = Self::READ | Self::WRITE | Self::DELETE;
}

pub struct FileAttributes;

impl FileAttributes {
    pub const READONLY: u32 = 0x0000_0001;
    pub const HIDDEN: u32 = 0x0000_0002;
    pub const SYSTEM: u32 = 0x0000_0004;
    pub const DIRECTORY: u32 = 0x0000_0010;
    pub const ARCHIVE: u32 = 0x0000_0020;
    pub const NORMAL: u32 = 0x0000_0080;
}

pub struct CreateOptions;

impl CreateOptions {
    pub const DIRECTORY_FILE: u32 = 0x0000_0001;
    pub const NON_DIRECTORY_FILE: u32 = 0x0000_0040;
}

/// File information classes used with QUERY_DIRECTORY and SET_INFO.
pub struct FileInfoClass;

impl FileInfoClass {
    pub const DIRECTORY_INFORMATION: u8 = 0x01;
    pub const RENAME_INFORMATION: u8 = 0x0A;
    pub const DISPOSITION_INFORMATION: u8 = 0x0D;
}

const INFO_TYPE_FILE: u8 = 0x01;
const QUERY_DIRECTORY_RESTART_SCANS: u8 = 0x01;

/// Assembled request: header plus command body.
pub fn encode_message(header: &Smb2Header, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(SMB2_HEADER_SIZE + body.len());
    header.encode(&mut buf);
    buf.put_slice(body);
    buf
}

/// Write one message behind the direct-TCP session header.
pub fn write_frame<W: Write>(writer: &mut W, message: &[u8]) -> SmbResult<()> {
    if message.len() > 0x00FF_FFFF {
        return Err(SmbError::Protocol(format!(
            "Message of {} bytes exceeds the transport frame limit",
            message.len()
        )));
    }
    let len = message.len() as u32;
    let mut frame = Vec::with_capacity(4 + message.len());
    frame.push(0);
    frame.extend_from_slice(&len.to_be_bytes()[1..]);
    frame.extend_from_slice(message);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(reader: &mut R) -> SmbResult<Vec<u8>> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    if prefix[0] != 0 {
        return Err(SmbError::Protocol(format!(
            "Unexpected session message type 0x{:02X}",
            prefix[0]
        )));
    }
    let len = u32::from_be_bytes([0, prefix[1], prefix[2], prefix[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(SmbError::Protocol(format!("Frame of {} bytes is too large", len)));
    }
    let mut message = vec![0u8; len];
    reader.read_exact(&mut message)?;
    Ok(message)
}

pub fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

pub fn from_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

pub fn filetime_to_datetime(filetime: u64) -> DateTime<Utc> {
    let ticks = filetime as i64 - FILETIME_UNIX_OFFSET;
    let secs = ticks.div_euclid(10_000_000);
    let nanos = (ticks.rem_euclid(10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}

pub fn datetime_to_filetime(time: DateTime<Utc>) -> u64 {
    let ticks = time.timestamp() * 10_000_000 + i64::from(time.timestamp_subsec_nanos() / 100);
    (ticks + FILETIME_UNIX_OFFSET).max(0) as u64
}

/// Bytes `[offset, offset + len)` of a message, bounds-checked.
fn slice<'a>(message: &'a [u8], offset: usize, len: usize, what: &str) -> SmbResult<&'a [u8]> {
    message
        .get(offset..offset.saturating_add(len))
        .ok_or_else(|| SmbError::Protocol(format!("{} lies outside the message", what)))
}

/// Response body after the header, at least `min` bytes long.
fn body<'a>(message: &'a [u8], min: usize, what: &str) -> SmbResult<&'a [u8]> {
    slice(message, SMB2_HEADER_SIZE, min, what)?;
    Ok(&message[SMB2_HEADER_SIZE..])
}

// Requests

pub fn negotiate_request(client_guid: &[u8; 16], security_mode: u16, dialects: &[u16]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(36 + dialects.len() * 2);
    buf.put_u16_le(36);
    buf.put_u16_le(dialects.len() as u16);
    buf.put_u16_le(security_mode);
    buf.put_u16_le(0); // Reserved
    buf.put_u32_le(0); // Capabilities
    buf.put_slice(client_guid);
    buf.put_u64_le(0); // ClientStartTime
    for dialect in dialects {
        buf.put_u16_le(*dialect);
    }
    buf
}

pub fn session_setup_request(security_mode: u8, token: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(24 + token.len());
    buf.put_u16_le(25);
    buf.put_u8(0); // Flags
    buf.put_u8(security_mode);
    buf.put_u32_le(0); // Capabilities
    buf.put_u32_le(0); // Channel
    buf.put_u16_le((SMB2_HEADER_SIZE + 24) as u16);
    buf.put_u16_le(token.len() as u16);
    buf.put_u64_le(0); // PreviousSessionId
    buf.put_slice(token);
    buf
}

pub fn logoff_request() -> BytesMut {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16_le(4);
    buf.put_u16_le(0);
    buf
}

pub fn tree_connect_request(unc_path: &str) -> BytesMut {
    let path = utf16le(unc_path);
    let mut buf = BytesMut::with_capacity(8 + path.len());
    buf.put_u16_le(9);
    buf.put_u16_le(0); // Reserved
    buf.put_u16_le((SMB2_HEADER_SIZE + 8) as u16);
    buf.put_u16_le(path.len() as u16);
    buf.put_slice(&path);
    buf
}

pub fn tree_disconnect_request() -> BytesMut {
    logoff_request()
}

#[derive(Debug, Clone)]
pub struct CreateRequest<'a> {
    pub name: &'a str,
    pub desired_access: u32,
    pub file_attributes: u32,
    pub share_access: u32,
    pub disposition: CreateDisposition,
    pub options: u32,
}

impl CreateRequest<'_> {
    pub fn encode(&self) -> BytesMut {
        let name = utf16le(self.name);
        let mut buf = BytesMut::with_capacity(56 + name.len().max(1));
        buf.put_u16_le(57);
        buf.put_u8(0); // SecurityFlags
        buf.put_u8(0); // RequestedOplockLevel: none
        buf.put_u32_le(2); // ImpersonationLevel: Impersonation
        buf.put_u64_le(0); // SmbCreateFlags
        buf.put_u64_le(0); // Reserved
        buf.put_u32_le(self.desired_access);
        buf.put_u32_le(self.file_attributes);
        buf.put_u32_le(self.share_access);
        buf.put_u32_le(self.disposition as u32);
        buf.put_u32_le(self.options);
        buf.put_u16_le((SMB2_HEADER_SIZE + 56) as u16);
        buf.put_u16_le(name.len() as u16);
        buf.put_u32_le(0); // CreateContextsOffset
        buf.put_u32_le(0); // CreateContextsLength
        if name.is_empty() {
            buf.put_u8(0);
        } else {
            buf.put_slice(&name);
        }
        buf
    }
}

pub fn close_request(file_id: FileId) -> BytesMut {
    let mut buf = BytesMut::with_capacity(24);
    buf.put_u16_le(24);
    buf.put_u16_le(0); // Flags
    buf.put_u32_le(0); // Reserved
    file_id.encode(&mut buf);
    buf
}

pub fn read_request(file_id: FileId, offset: u64, length: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(49);
    buf.put_u16_le(49);
    buf.put_u8(0x50); // Padding: data starts right after the response header
    buf.put_u8(0); // Flags
    buf.put_u32_le(length);
    buf.put_u64_le(offset);
    file_id.encode(&mut buf);
    buf.put_u32_le(0); // MinimumCount
    buf.put_u32_le(0); // Channel
    buf.put_u32_le(0); // RemainingBytes
    buf.put_u16_le(0); // ReadChannelInfoOffset
    buf.put_u16_le(0); // ReadChannelInfoLength
    buf.put_u8(0);
    buf
}

pub fn write_request(file_id: FileId, offset: u64, data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(48 + data.len());
    buf.put_u16_le(49);
    buf.put_u16_le((SMB2_HEADER_SIZE + 48) as u16);
    buf.put_u32_le(data.len() as u32);
    buf.put_u64_le(offset);
    file_id.encode(&mut buf);
    buf.put_u32_le(0); // Channel
    buf.put_u32_le(0); // RemainingBytes
    buf.put_u16_le(0); // WriteChannelInfoOffset
    buf.put_u16_le(0); // WriteChannelInfoLength
    buf.put_u32_le(0); // Flags
    buf.put_slice(data);
    buf
}

pub fn query_directory_request(
    file_id: FileId,
    pattern: &str,
    restart: bool,
    output_buffer_length: u32,
) -> BytesMut {
    let pattern = utf16le(pattern);
    let mut buf = BytesMut::with_capacity(32 + pattern.len());
    buf.put_u16_le(33);
    buf.put_u8(FileInfoClass::DIRECTORY_INFORMATION);
    buf.put_u8(if restart { QUERY_DIRECTORY_RESTART_SCANS } else { 0 });
    buf.put_u32_le(0); // FileIndex
    file_id.encode(&mut buf);
    buf.put_u16_le((SMB2_HEADER_SIZE + 32) as u16);
    buf.put_u16_le(pattern.len() as u16);
    buf.put_u32_le(output_buffer_length);
    buf.put_slice(&pattern);
    buf
}

pub fn set_info_request(file_id: FileId, info_class: u8, info: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(32 + info.len());
    buf.put_u16_le(33);
    buf.put_u8(INFO_TYPE_FILE);
    buf.put_u8(info_class);
    buf.put_u32_le(info.len() as u32);
    buf.put_u16_le((SMB2_HEADER_SIZE + 32) as u16);
    buf.put_u16_le(0); // Reserved
    buf.put_u32_le(0); // AdditionalInformation
    file_id.encode(&mut buf);
    buf.put_slice(info);
    buf
}

/// FileRenameInformation; `target` is relative to the share root.
pub fn rename_information(target: &str, replace_if_exists: bool) -> Vec<u8> {
    let name = utf16le(target);
    let mut buf = BytesMut::with_capacity(20 + name.len());
    buf.put_u8(u8::from(replace_if_exists));
    buf.put_bytes(0, 7); // Reserved
    buf.put_u64_le(0); // RootDirectory
    buf.put_u32_le(name.len() as u32);
    buf.put_slice(&name);
    buf.to_vec()
}

pub fn disposition_information(delete_pending: bool) -> Vec<u8> {
    vec![u8::from(delete_pending)]
}

// Responses

#[derive(Debug, Clone)]
pub struct NegotiateResponse {
    pub security_mode: u16,
    pub dialect: u16,
    pub server_guid: [u8; 16],
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub security_buffer: Vec<u8>,
}

impl NegotiateResponse {
    pub fn parse(message: &[u8]) -> SmbResult<Self> {
        let mut buf = body(message, 64, "NEGOTIATE response")?;
        let _structure_size = buf.get_u16_le();
        let security_mode = buf.get_u16_le();
        let dialect = buf.get_u16_le();
        let _reserved = buf.get_u16_le();
        let mut server_guid = [0u8; 16];
        buf.copy_to_slice(&mut server_guid);
        let _capabilities = buf.get_u32_le();
        let max_transact_size = buf.get_u32_le();
        let max_read_size = buf.get_u32_le();
        let max_write_size = buf.get_u32_le();
        let _system_time = buf.get_u64_le();
        let _server_start_time = buf.get_u64_le();
        let offset = buf.get_u16_le() as usize;
        let len = buf.get_u16_le() as usize;
        let security_buffer = if len == 0 {
            Vec::new()
        } else {
            slice(message, offset, len, "NEGOTIATE security buffer")?.to_vec()
        };

        Ok(Self {
            security_mode,
            dialect,
            server_guid,
            max_transact_size,
            max_read_size,
            max_write_size,
            security_buffer,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SessionSetupResponse {
    pub session_flags: u16,
    pub security_buffer: Vec<u8>,
}

impl SessionSetupResponse {
    pub fn parse(message: &[u8]) -> SmbResult<Self> {
        let mut buf = body(message, 8, "SESSION_SETUP response")?;
        let _structure_size = buf.get_u16_le();
        let session_flags = buf.get_u16_le();
        let offset = buf.get_u16_le() as usize;
        let len = buf.get_u16_le() as usize;
        let security_buffer = if len == 0 {
            Vec::new()
        } else {
            slice(message, offset, len, "SESSION_SETUP security buffer")?.to_vec()
        };
        Ok(Self {
            session_flags,
            security_buffer,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CreateResponse {
    pub file_id: FileId,
    pub creation_time: u64,
    pub last_write_time: u64,
    pub end_of_file: u64,
    pub file_attributes: u32,
}

impl CreateResponse {
    pub fn parse(message: &[u8]) -> SmbResult<Self> {
        let mut buf = body(message, 88, "CREATE response")?;
        let _structure_size = buf.get_u16_le();
        let _oplock_level = buf.get_u8();
        let _flags = buf.get_u8();
        let _create_action = buf.get_u32_le();
        let creation_time = buf.get_u64_le();
        let _last_access_time = buf.get_u64_le();
        let last_write_time = buf.get_u64_le();
        let _change_time = buf.get_u64_le();
        let _allocation_size = buf.get_u64_le();
        let end_of_file = buf.get_u64_le();
        let file_attributes = buf.get_u32_le();
        let _reserved = buf.get_u32_le();
        let file_id = FileId::parse(&mut buf);
        Ok(Self {
            file_id,
            creation_time,
            last_write_time,
            end_of_file,
            file_attributes,
        })
    }
}

/// Data payload of a READ response.
pub fn parse_read_response(message: &[u8]) -> SmbResult<&[u8]> {
    let mut buf = body(message, 16, "READ response")?;
    let _structure_size = buf.get_u16_le();
    let offset = buf.get_u8() as usize;
    let _reserved = buf.get_u8();
    let len = buf.get_u32_le() as usize;
    slice(message, offset, len, "READ data")
}

/// Number of bytes the server accepted.
pub fn parse_write_response(message: &[u8]) -> SmbResult<u32> {
    let mut buf = body(message, 8, "WRITE response")?;
    let _structure_size = buf.get_u16_le();
    let _reserved = buf.get_u16_le();
    Ok(buf.get_u32_le())
}

/// Output buffer of a QUERY_DIRECTORY response.
pub fn parse_query_directory_response(message: &[u8]) -> SmbResult<&[u8]> {
    let mut buf = body(message, 8, "QUERY_DIRECTORY response")?;
    let _structure_size = buf.get_u16_le();
    let offset = buf.get_u16_le() as usize;
    let len = buf.get_u32_le() as usize;
    if len == 0 {
        return Ok(&[]);
    }
    slice(message, offset, len, "QUERY_DIRECTORY output")
}

/// One entry of FileDirectoryInformation.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub name: String,
    pub creation_time: u64,
    pub last_write_time: u64,
    pub end_of_file: u64,
    pub file_attributes: u32,
}

impl DirectoryEntry {
    pub fn is_directory(&self) -> bool {
        self.file_attributes & FileAttributes::DIRECTORY != 0
    }

    pub fn is_readonly(&self) -> bool {
        self.file_attributes & FileAttributes::READONLY != 0
    }

    pub fn is_hidden(&self) -> bool {
        self.file_attributes & FileAttributes::HIDDEN != 0
    }

    pub fn is_archive(&self) -> bool {
        self.file_attributes & FileAttributes::ARCHIVE != 0
    }

    pub fn modified(&self) -> DateTime<Utc> {
        filetime_to_datetime(self.last_write_time)
    }

    pub fn created(&self) -> DateTime<Utc> {
        filetime_to_datetime(self.creation_time)
    }
}

impl From<(&str, &CreateResponse)> for DirectoryEntry {
    fn from((name, response): (&str, &CreateResponse)) -> Self {
        Self {
            name: name.to_string(),
            creation_time: response.creation_time,
            last_write_time: response.last_write_time,
            end_of_file: response.end_of_file,
            file_attributes: response.file_attributes,
        }
    }
}

const DIRECTORY_INFORMATION_SIZE: usize = 64;

pub fn parse_directory_entries(output: &[u8]) -> SmbResult<Vec<DirectoryEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset < output.len() {
        let record = slice(output, offset, DIRECTORY_INFORMATION_SIZE, "Directory entry")?;
        let mut buf = record;
        let next_entry_offset = buf.get_u32_le() as usize;
        let _file_index = buf.get_u32_le();
        let creation_time = buf.get_u64_le();
        let _last_access_time = buf.get_u64_le();
        let last_write_time = buf.get_u64_le();
        let _change_time = buf.get_u64_le();
        let end_of_file = buf.get_u64_le();
        let _allocation_size = buf.get_u64_le();
        let file_attributes = buf.get_u32_le();
        let name_len = buf.get_u32_le() as usize;
        let name = slice(
            output,
            offset + DIRECTORY_INFORMATION_SIZE,
            name_len,
            "Directory entry name",
        )?;

        entries.push(DirectoryEntry {
            name: from_utf16le(name),
            creation_time,
            last_write_time,
            end_of_file,
            file_attributes,
        });

        if next_entry_offset == 0 {
            break;
        }
        offset += next_entry_offset;
    }
    Ok(entries)
}
