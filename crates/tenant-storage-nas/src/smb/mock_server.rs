//! In-process SMB2 server backed by an in-memory share.
//!
//! Speaks just enough of dialect 2.1 for the client: NTLM session setup
//! without signing, one tree, handles, directory listing, chunked reads
//! and writes, rename and delete-on-close.

use std::collections::{BTreeMap, HashMap};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, MutexGuard};
use std::thread;

use bytes::{Buf, BufMut, BytesMut};

use super::error::NtStatus;
use super::ntlm::{NegotiateFlags, NTLMSSP_SIGNATURE};
use super::protocol::{
    encode_message, from_utf16le, read_frame, utf16le, write_frame, CreateDisposition,
    CreateOptions, FileAttributes, FileInfoClass, SecurityMode, Smb2Flags, Smb2Header,
    SmbCommand, DIALECT_SMB_2_1, SMB2_HEADER_SIZE,
};

/// Account the server accepts.
pub const USERNAME: &str = "user";

/// Largest READ/WRITE the server advertises, small enough to force chunking.
pub const IO_SIZE: u32 = 1024;

const TREE_ID: u32 = 7;
const FILETIME: u64 = 133_000_000_000_000_000;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Directory,
    File(Vec<u8>),
}

type Share = Arc<Mutex<BTreeMap<String, Node>>>;

pub struct MockServer {
    port: u16,
    share: Share,
    sessions: Arc<AtomicUsize>,
    reported_size: Arc<AtomicU64>,
}

impl MockServer {
    pub fn start() -> Self {
        Self::spawn(None)
    }

    /// Server whose first READ of any `*.gate` file waits until `parties`
    /// such reads are in flight at once.
    pub fn gated(parties: usize) -> Self {
        Self::spawn(Some(Arc::new(Barrier::new(parties))))
    }

    fn spawn(gate: Option<Arc<Barrier>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = Self {
            port,
            share: Arc::default(),
            sessions: Arc::default(),
            reported_size: Arc::default(),
        };

        let share = Arc::clone(&server.share);
        let sessions = Arc::clone(&server.sessions);
        let reported_size = Arc::clone(&server.reported_size);
        thread::spawn(move || {
            for (index, stream) in listener.incoming().enumerate() {
                let Ok(stream) = stream else { continue };
                let connection = Connection {
                    stream,
                    share: Arc::clone(&share),
                    sessions: Arc::clone(&sessions),
                    reported_size: Arc::clone(&reported_size),
                    gate: gate.clone(),
                    session_id: 0x100 + index as u64,
                    authenticated: false,
                    handles: HashMap::new(),
                    next_handle: 1,
                };
                thread::spawn(move || connection.serve());
            }
        });
        server
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sessions that completed authentication so far.
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Make CREATE responses claim every file is `size` bytes long.
    pub fn report_size(&self, size: u64) {
        self.reported_size.store(size, Ordering::SeqCst);
    }

    /// Add a directory and its missing ancestors.
    pub fn mkdir(&self, path: &str) {
        let mut share = lock(&self.share);
        let mut current = String::new();
        for segment in path.split('\\').filter(|s| !s.is_empty()) {
            if !current.is_empty() {
                current.push('\\');
            }
            current.push_str(segment);
            share.entry(current.clone()).or_insert(Node::Directory);
        }
    }

    pub fn put(&self, path: &str, data: &[u8]) {
        if let Some((parent, _)) = path.rsplit_once('\\') {
            self.mkdir(parent);
        }
        lock(&self.share).insert(path.to_string(), Node::File(data.to_vec()));
    }

    pub fn node(&self, path: &str) -> Option<Node> {
        lock(&self.share).get(path).cloned()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.node(path) {
            Some(Node::File(data)) => Some(data),
            _ => None,
        }
    }
}

fn lock(share: &Share) -> MutexGuard<'_, BTreeMap<String, Node>> {
    share.lock().unwrap()
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('\\').map_or("", |(parent, _)| parent)
}

/// `Some(true)` for a directory, `Some(false)` for a file.
fn kind(share: &BTreeMap<String, Node>, path: &str) -> Option<bool> {
    if path.is_empty() {
        return Some(true);
    }
    share.get(path).map(|node| matches!(node, Node::Directory))
}

fn has_children(share: &BTreeMap<String, Node>, path: &str) -> bool {
    share.keys().any(|k| !k.is_empty() && parent_of(k) == path)
}

fn u16_at(bytes: &[u8], at: usize) -> usize {
    (&bytes[at..]).get_u16_le() as usize
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    (&bytes[at..]).get_u32_le()
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    (&bytes[at..]).get_u64_le()
}

struct Handle {
    path: String,
    delete_on_close: bool,
    listed: bool,
}

struct Connection {
    stream: TcpStream,
    share: Share,
    sessions: Arc<AtomicUsize>,
    reported_size: Arc<AtomicU64>,
    gate: Option<Arc<Barrier>>,
    session_id: u64,
    authenticated: bool,
    handles: HashMap<u64, Handle>,
    next_handle: u64,
}

type Reply = (NtStatus, Vec<u8>);

fn error(status: NtStatus) -> Reply {
    let mut body = BytesMut::new();
    body.put_u16_le(9);
    body.put_u16_le(0);
    body.put_u32_le(0);
    body.put_u8(0);
    (status, body.to_vec())
}

fn ok(body: BytesMut) -> Reply {
    (NtStatus::SUCCESS, body.to_vec())
}

fn fixed(structure_size: u16, len: usize) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u16_le(structure_size);
    body.put_bytes(0, len - 2);
    body
}

impl Connection {
    fn serve(mut self) {
        while let Ok(request) = read_frame(&mut self.stream) {
            let Ok(header) = Smb2Header::parse(&request) else {
                return;
            };
            let (status, body) = self.dispatch(&header, &request);

            let tree_id = if header.command == SmbCommand::TreeConnect {
                TREE_ID
            } else {
                header.tree_id
            };
            let mut response =
                Smb2Header::new_request(header.command, header.message_id, self.session_id, tree_id);
            response.status = status;
            response.flags = Smb2Flags::new(Smb2Flags::RESPONSE);
            if write_frame(&mut self.stream, &encode_message(&response, &body)).is_err() {
                return;
            }
        }
    }

    fn dispatch(&mut self, header: &Smb2Header, message: &[u8]) -> Reply {
        match header.command {
            SmbCommand::Negotiate => negotiate(),
            SmbCommand::SessionSetup => self.session_setup(message),
            _ if !self.authenticated => error(NtStatus::USER_SESSION_DELETED),
            SmbCommand::TreeConnect => ok(fixed(16, 16)),
            SmbCommand::Create => self.create(message),
            SmbCommand::Close => self.close(&message[SMB2_HEADER_SIZE..]),
            SmbCommand::Read => self.read(&message[SMB2_HEADER_SIZE..]),
            SmbCommand::Write => self.write(message),
            SmbCommand::QueryDirectory => self.query_directory(&message[SMB2_HEADER_SIZE..]),
            SmbCommand::SetInfo => self.set_info(message),
            SmbCommand::TreeDisconnect | SmbCommand::Logoff => ok(fixed(4, 4)),
            _ => error(NtStatus::NOT_SUPPORTED),
        }
    }

    fn session_setup(&mut self, message: &[u8]) -> Reply {
        let body = &message[SMB2_HEADER_SIZE..];
        let offset = u16_at(body, 12);
        let token = &message[offset..offset + u16_at(body, 14)];
        let Some(at) = token
            .windows(NTLMSSP_SIGNATURE.len())
            .position(|w| w == NTLMSSP_SIGNATURE)
        else {
            return error(NtStatus::INVALID_PARAMETER);
        };
        let ntlm = &token[at..];

        match u32_at(ntlm, 8) {
            1 => (NtStatus::MORE_PROCESSING_REQUIRED, session_setup_body(&challenge())),
            3 => {
                // UserName fields of the AUTHENTICATE message
                let len = u16_at(ntlm, 36);
                let offset = u32_at(ntlm, 40) as usize;
                if from_utf16le(&ntlm[offset..offset + len]) != USERNAME {
                    return error(NtStatus::LOGON_FAILURE);
                }
                self.authenticated = true;
                self.sessions.fetch_add(1, Ordering::SeqCst);
                (NtStatus::SUCCESS, session_setup_body(&[]))
            }
            _ => error(NtStatus::INVALID_PARAMETER),
        }
    }

    fn create(&mut self, message: &[u8]) -> Reply {
        let body = &message[SMB2_HEADER_SIZE..];
        let disposition = u32_at(body, 36);
        let options = u32_at(body, 40);
        let name_offset = u16_at(body, 44);
        let path = from_utf16le(&message[name_offset..name_offset + u16_at(body, 46)]);
        let wants_directory = options & CreateOptions::DIRECTORY_FILE != 0;
        let wants_file = options & CreateOptions::NON_DIRECTORY_FILE != 0;

        let mut share = lock(&self.share);
        match kind(&share, &path) {
            Some(_) if disposition == CreateDisposition::Create as u32 => {
                return error(NtStatus::OBJECT_NAME_COLLISION)
            }
            Some(true) if wants_file => return error(NtStatus::FILE_IS_A_DIRECTORY),
            Some(false) if wants_directory => return error(NtStatus::NOT_A_DIRECTORY),
            Some(false) if disposition == CreateDisposition::OverwriteIf as u32 => {
                share.insert(path.clone(), Node::File(Vec::new()));
            }
            Some(_) => {}
            None if kind(&share, parent_of(&path)) != Some(true) => {
                return error(NtStatus::OBJECT_PATH_NOT_FOUND)
            }
            None if disposition == CreateDisposition::Open as u32 => {
                return error(NtStatus::OBJECT_NAME_NOT_FOUND)
            }
            None => {
                let node = if wants_directory {
                    Node::Directory
                } else {
                    Node::File(Vec::new())
                };
                share.insert(path.clone(), node);
            }
        }

        let (is_directory, mut size) = match share.get(&path) {
            Some(Node::File(data)) => (false, data.len() as u64),
            _ => (true, 0),
        };
        drop(share);
        let reported = self.reported_size.load(Ordering::SeqCst);
        if !is_directory && reported != 0 {
            size = reported;
        }

        let id = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(
            id,
            Handle {
                path,
                delete_on_close: false,
                listed: false,
            },
        );

        let mut body = BytesMut::new();
        body.put_u16_le(89);
        body.put_u8(0);
        body.put_u8(0);
        body.put_u32_le(1);
        for _ in 0..4 {
            body.put_u64_le(FILETIME);
        }
        body.put_u64_le(size);
        body.put_u64_le(size);
        body.put_u32_le(if is_directory {
            FileAttributes::DIRECTORY
        } else {
            FileAttributes::ARCHIVE
        });
        body.put_u32_le(0);
        body.put_u64_le(id);
        body.put_u64_le(id);
        body.put_u32_le(0);
        body.put_u32_le(0);
        ok(body)
    }

    fn close(&mut self, body: &[u8]) -> Reply {
        let Some(handle) = self.handles.remove(&u64_at(body, 8)) else {
            return error(NtStatus::INVALID_PARAMETER);
        };
        if handle.delete_on_close {
            lock(&self.share).remove(&handle.path);
        }
        ok(fixed(60, 60))
    }

    fn read(&mut self, body: &[u8]) -> Reply {
        let length = u32_at(body, 4) as usize;
        let offset = u64_at(body, 8) as usize;
        let Some(handle) = self.handles.get(&u64_at(body, 16)) else {
            return error(NtStatus::INVALID_PARAMETER);
        };
        if offset == 0 && handle.path.ends_with(".gate") {
            if let Some(gate) = &self.gate {
                gate.wait();
            }
        }

        let share = lock(&self.share);
        let Some(Node::File(data)) = share.get(&handle.path) else {
            return error(NtStatus::INVALID_PARAMETER);
        };
        if offset >= data.len() {
            return error(NtStatus::END_OF_FILE);
        }
        let chunk = &data[offset..(offset + length).min(data.len())];

        let mut reply = BytesMut::new();
        reply.put_u16_le(17);
        reply.put_u8((SMB2_HEADER_SIZE + 16) as u8);
        reply.put_u8(0);
        reply.put_u32_le(chunk.len() as u32);
        reply.put_u32_le(0);
        reply.put_u32_le(0);
        reply.put_slice(chunk);
        ok(reply)
    }

    fn write(&mut self, message: &[u8]) -> Reply {
        let body = &message[SMB2_HEADER_SIZE..];
        let data_offset = u16_at(body, 2);
        let length = u32_at(body, 4) as usize;
        let offset = u64_at(body, 8) as usize;
        let Some(handle) = self.handles.get(&u64_at(body, 16)) else {
            return error(NtStatus::INVALID_PARAMETER);
        };
        let data = &message[data_offset..data_offset + length];

        let mut share = lock(&self.share);
        let Some(Node::File(contents)) = share.get_mut(&handle.path) else {
            return error(NtStatus::INVALID_PARAMETER);
        };
        if contents.len() < offset + length {
            contents.resize(offset + length, 0);
        }
        contents[offset..offset + length].copy_from_slice(data);

        let mut reply = BytesMut::new();
        reply.put_u16_le(17);
        reply.put_u16_le(0);
        reply.put_u32_le(length as u32);
        reply.put_u32_le(0);
        reply.put_u32_le(0);
        ok(reply)
    }

    fn query_directory(&mut self, body: &[u8]) -> Reply {
        let restart = body[3] & 0x01 != 0;
        let Some(handle) = self.handles.get_mut(&u64_at(body, 8)) else {
            return error(NtStatus::INVALID_PARAMETER);
        };
        if handle.listed && !restart {
            return error(NtStatus::NO_MORE_FILES);
        }
        handle.listed = true;

        let share = lock(&self.share);
        let mut entries = vec![(".".to_string(), true, 0u64), ("..".to_string(), true, 0)];
        for (path, node) in share.iter() {
            if parent_of(path) != handle.path || path.is_empty() {
                continue;
            }
            let name = path.rsplit('\\').next().unwrap_or(path).to_string();
            match node {
                Node::Directory => entries.push((name, true, 0)),
                Node::File(data) => entries.push((name, false, data.len() as u64)),
            }
        }

        let mut output = BytesMut::new();
        let count = entries.len();
        for (i, (name, is_directory, size)) in entries.into_iter().enumerate() {
            let encoded = utf16le(&name);
            let total = 64 + encoded.len();
            let padded = (total + 7) & !7;
            let last = i + 1 == count;
            output.put_u32_le(if last { 0 } else { padded as u32 });
            output.put_u32_le(0);
            for _ in 0..4 {
                output.put_u64_le(FILETIME);
            }
            output.put_u64_le(size);
            output.put_u64_le(size);
            output.put_u32_le(if is_directory {
                FileAttributes::DIRECTORY
            } else {
                FileAttributes::ARCHIVE
            });
            output.put_u32_le(encoded.len() as u32);
            output.put_slice(&encoded);
            if !last {
                output.put_bytes(0, padded - total);
            }
        }

        let mut reply = BytesMut::new();
        reply.put_u16_le(9);
        reply.put_u16_le((SMB2_HEADER_SIZE + 8) as u16);
        reply.put_u32_le(output.len() as u32);
        reply.put_slice(&output);
        ok(reply)
    }

    fn set_info(&mut self, message: &[u8]) -> Reply {
        let body = &message[SMB2_HEADER_SIZE..];
        let class = body[3];
        let len = u32_at(body, 4) as usize;
        let offset = u16_at(body, 8);
        let info = &message[offset..offset + len];
        let Some(handle) = self.handles.get_mut(&u64_at(body, 16)) else {
            return error(NtStatus::INVALID_PARAMETER);
        };

        let mut share = lock(&self.share);
        match class {
            FileInfoClass::DISPOSITION_INFORMATION => {
                if info[0] != 0 && has_children(&share, &handle.path) {
                    return error(NtStatus::DIRECTORY_NOT_EMPTY);
                }
                handle.delete_on_close = info[0] != 0;
            }
            FileInfoClass::RENAME_INFORMATION => {
                let replace = info[0] != 0;
                let name_len = u32_at(info, 16) as usize;
                let target = from_utf16le(&info[20..20 + name_len]);
                match kind(&share, &target) {
                    Some(_) if !replace => return error(NtStatus::OBJECT_NAME_COLLISION),
                    Some(true) => return error(NtStatus::ACCESS_DENIED),
                    Some(false) => {
                        share.remove(&target);
                    }
                    None => {}
                }
                if kind(&share, parent_of(&target)) != Some(true) {
                    return error(NtStatus::OBJECT_PATH_NOT_FOUND);
                }

                let prefix = format!("{}\\", handle.path);
                let moved: Vec<String> = share
                    .keys()
                    .filter(|k| **k == handle.path || k.starts_with(&prefix))
                    .cloned()
                    .collect();
                for old in moved {
                    if let Some(node) = share.remove(&old) {
                        let renamed = format!("{}{}", target, &old[handle.path.len()..]);
                        share.insert(renamed, node);
                    }
                }
                handle.path = target;
            }
            _ => return error(NtStatus::NOT_SUPPORTED),
        }
        ok(fixed(2, 2))
    }
}

fn negotiate() -> Reply {
    let mut body = BytesMut::new();
    body.put_u16_le(65);
    body.put_u16_le(SecurityMode::SIGNING_ENABLED);
    body.put_u16_le(DIALECT_SMB_2_1);
    body.put_u16_le(0);
    body.put_bytes(0x5A, 16);
    body.put_u32_le(0);
    body.put_u32_le(IO_SIZE);
    body.put_u32_le(IO_SIZE);
    body.put_u32_le(IO_SIZE);
    body.put_u64_le(FILETIME);
    body.put_u64_le(0);
    body.put_u16_le(0);
    body.put_u16_le(0);
    body.put_u32_le(0);
    ok(body)
}

fn session_setup_body(token: &[u8]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u16_le(9);
    body.put_u16_le(0);
    body.put_u16_le(if token.is_empty() {
        0
    } else {
        (SMB2_HEADER_SIZE + 8) as u16
    });
    body.put_u16_le(token.len() as u16);
    body.put_slice(token);
    body.to_vec()
}

/// NTLM CHALLENGE message without target info.
fn challenge() -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_slice(NTLMSSP_SIGNATURE);
    buf.put_u32_le(2);
    buf.put_u16_le(0);
    buf.put_u16_le(0);
    buf.put_u32_le(48);
    buf.put_u32_le(NegotiateFlags::CLIENT);
    buf.put_slice(&[0x11; 8]);
    buf.put_bytes(0, 8);
    buf.put_u16_le(0);
    buf.put_u16_le(0);
    buf.put_u32_le(48);
    buf.to_vec()
}
