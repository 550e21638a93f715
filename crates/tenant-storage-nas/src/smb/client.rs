//! Blocking SMB2 client.
//!
//! One client owns one TCP connection, one authenticated session and one
//! tree (share). Requests are strictly sequential; the async adapter runs
//! every call on the blocking thread pool.

use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info, warn};

use super::error::{NtStatus, SmbError, SmbResult};
use super::netbios;
use super::ntlm::{self, ChallengeMessage, Credentials};
use super::protocol::{
    close_request, datetime_to_filetime, disposition_information, encode_message,
    logoff_request, negotiate_request, parse_directory_entries, parse_query_directory_response,
    parse_read_response, parse_write_response, query_directory_request, read_frame,
    read_request, rename_information, session_setup_request, set_info_request,
    tree_connect_request, tree_disconnect_request, write_frame, write_request, CreateDisposition,
    CreateOptions, CreateRequest, CreateResponse, DesiredAccess, DirectoryEntry, FileAttributes,
    FileId, FileInfoClass, NegotiateResponse, SecurityMode, SessionFlags, SessionSetupResponse,
    ShareAccess, Smb2Header, SmbCommand, DIALECT_SMB_2_0_2, DIALECT_SMB_2_1,
    SMB2_HEADER_SIZE,
};
use super::spnego;
use crate::config::SmbConfig;

type HmacSha256 = Hmac<Sha256>;

/// Largest single READ/WRITE/QUERY_DIRECTORY payload (one credit).
const MAX_IO_CHUNK: u32 = 64 * 1024;

/// Upper bound on the NetBIOS lookup, independent of the transport timeout.
const NETBIOS_TIMEOUT: Duration = Duration::from_secs(2);

const SIGNATURE_RANGE: std::ops::Range<usize> = 48..64;

/// A decoded response: parsed header plus the whole message, since body
/// offsets are relative to the start of the header.
#[derive(Debug)]
pub struct Response {
    pub header: Smb2Header,
    pub data: Vec<u8>,
}

pub struct SmbClient {
    stream: TcpStream,
    message_id: u64,
    session_id: u64,
    tree_id: u32,
    dialect: u16,
    signing_key: Option<[u8; 16]>,
    max_read_size: u32,
    max_write_size: u32,
    max_transact_size: u32,
    unc_path: String,
}

impl SmbClient {
    /// Connect, negotiate, authenticate and mount the configured share.
    pub fn connect(config: &SmbConfig) -> SmbResult<Self> {
        let timeout = config.timeout();
        let server = netbios::resolve_server_name(&config.host, timeout.min(NETBIOS_TIMEOUT))
            .unwrap_or_else(|| config.host.clone());

        let stream = open_stream(&config.host, config.port, timeout)?;
        let mut client = Self {
            stream,
            message_id: 0,
            session_id: 0,
            tree_id: 0,
            dialect: 0,
            signing_key: None,
            max_read_size: MAX_IO_CHUNK,
            max_write_size: MAX_IO_CHUNK,
            max_transact_size: MAX_IO_CHUNK,
            unc_path: format!("\\\\{}\\{}", server, config.share),
        };

        let negotiate = client.negotiate()?;
        client.session_setup(config, &negotiate)?;
        client.tree_connect()?;

        info!(
            "SMB session established with {} (dialect 0x{:04X}, signing={})",
            client.unc_path,
            client.dialect,
            client.signing_key.is_some()
        );
        Ok(client)
    }

    pub fn dialect(&self) -> u16 {
        self.dialect
    }

    pub fn unc_path(&self) -> &str {
        &self.unc_path
    }

    fn negotiate(&mut self) -> SmbResult<NegotiateResponse> {
        let client_guid = *uuid::Uuid::new_v4().as_bytes();
        let body = negotiate_request(
            &client_guid,
            SecurityMode::SIGNING_ENABLED,
            &[DIALECT_SMB_2_0_2, DIALECT_SMB_2_1],
        );
        let response = self.call(SmbCommand::Negotiate, &body)?;
        let negotiate = NegotiateResponse::parse(&response.data)?;

        if negotiate.dialect != DIALECT_SMB_2_0_2 && negotiate.dialect != DIALECT_SMB_2_1 {
            return Err(SmbError::NotSupported(format!(
                "Server selected dialect 0x{:04X}",
                negotiate.dialect
            )));
        }
        self.dialect = negotiate.dialect;
        self.max_read_size = negotiate.max_read_size.clamp(1, MAX_IO_CHUNK);
        self.max_write_size = negotiate.max_write_size.clamp(1, MAX_IO_CHUNK);
        self.max_transact_size = negotiate.max_transact_size.clamp(1, MAX_IO_CHUNK);
        debug!(
            "Negotiated SMB dialect 0x{:04X} (security_mode=0x{:04X})",
            negotiate.dialect, negotiate.security_mode
        );
        Ok(negotiate)
    }

    fn session_setup(&mut self, config: &SmbConfig, negotiate: &NegotiateResponse) -> SmbResult<()> {
        let credentials = Credentials {
            username: &config.username,
            password: &config.password,
            domain: &config.domain,
            workstation: &config.client_name,
        };
        let security_mode = SecurityMode::SIGNING_ENABLED as u8;

        let token = spnego::wrap_negotiate(&ntlm::negotiate_message());
        let response = self.call_with(
            SmbCommand::SessionSetup,
            &session_setup_request(security_mode, &token),
            &[NtStatus::MORE_PROCESSING_REQUIRED],
        )?;
        if response.header.status != NtStatus::MORE_PROCESSING_REQUIRED {
            return Err(SmbError::AuthFailed(
                "Server completed the session without an NTLM challenge".to_string(),
            ));
        }
        self.session_id = response.header.session_id;

        let setup = SessionSetupResponse::parse(&response.data)?;
        let challenge = ChallengeMessage::parse(spnego::extract_ntlm_token(&setup.security_buffer)?)?;

        let mut client_challenge = [0u8; 8];
        client_challenge.copy_from_slice(&uuid::Uuid::new_v4().as_bytes()[..8]);
        let auth = ntlm::authenticate(
            &challenge,
            &credentials,
            config.use_ntlm_v2,
            client_challenge,
            datetime_to_filetime(Utc::now()),
        )?;

        let token = spnego::wrap_authenticate(&auth.message);
        let response = self
            .call(SmbCommand::SessionSetup, &session_setup_request(security_mode, &token))
            .map_err(|e| match e.status() {
                Some(NtStatus::LOGON_FAILURE) => SmbError::AuthFailed(format!(
                    "Logon failure for {}\\{}",
                    config.domain, config.username
                )),
                _ => e,
            })?;
        let setup = SessionSetupResponse::parse(&response.data)?;

        let anonymous = setup.session_flags & (SessionFlags::IS_GUEST | SessionFlags::IS_NULL) != 0;
        if anonymous {
            warn!("SMB server granted a guest session to {}", config.username);
        }
        if negotiate.security_mode & SecurityMode::SIGNING_REQUIRED != 0 {
            if anonymous {
                return Err(SmbError::AuthFailed(
                    "Server requires signing but granted a guest session".to_string(),
                ));
            }
            self.signing_key = Some(auth.session_key);
        }
        Ok(())
    }

    fn tree_connect(&mut self) -> SmbResult<()> {
        let body = tree_connect_request(&self.unc_path);
        let response = self.call(SmbCommand::TreeConnect, &body)?;
        self.tree_id = response.header.tree_id;
        Ok(())
    }

    /// Leave the share and end the session.
    pub fn logoff(mut self) -> SmbResult<()> {
        let tree = self.call(SmbCommand::TreeDisconnect, &tree_disconnect_request());
        let session = self.call(SmbCommand::Logoff, &logoff_request());
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("Shutting down SMB socket failed: {}", e);
        }
        tree.and(session).map(|_| ())
    }

    // Transport

    fn send(&mut self, command: SmbCommand, body: &[u8]) -> SmbResult<u64> {
        let message_id = self.message_id;
        self.message_id += 1;

        let mut header = Smb2Header::new_request(command, message_id, self.session_id, self.tree_id);
        if self.dialect == DIALECT_SMB_2_0_2 {
            header.credit_charge = 0;
        }
        let key = match command {
            SmbCommand::Negotiate | SmbCommand::SessionSetup => None,
            _ => self.signing_key,
        };
        if key.is_some() {
            header.flags.set_signed();
        }

        let mut message = encode_message(&header, body);
        if let Some(key) = key {
            let signature = sign(&key, &message)?;
            message[SIGNATURE_RANGE].copy_from_slice(&signature);
        }
        write_frame(&mut self.stream, &message)?;
        Ok(message_id)
    }

    fn receive(&mut self, message_id: u64) -> SmbResult<Response> {
        loop {
            let data = read_frame(&mut self.stream)?;
            let header = Smb2Header::parse(&data)?;
            if !header.flags.is_response() || header.message_id != message_id {
                debug!(
                    "Skipping unsolicited SMB message {:?} (id {})",
                    header.command, header.message_id
                );
                continue;
            }
            if header.status == NtStatus::PENDING && header.flags.is_async() {
                continue;
            }
            return Ok(Response { header, data });
        }
    }

    fn call(&mut self, command: SmbCommand, body: &[u8]) -> SmbResult<Response> {
        self.call_with(command, body, &[])
    }

    /// Send a request and wait for its response; statuses in `accept` are
    /// returned to the caller instead of failing.
    fn call_with(
        &mut self,
        command: SmbCommand,
        body: &[u8],
        accept: &[NtStatus],
    ) -> SmbResult<Response> {
        let message_id = self.send(command, body)?;
        let response = self.receive(message_id)?;
        let status = response.header.status;
        if status.is_success() || accept.contains(&status) {
            Ok(response)
        } else {
            Err(SmbError::NtStatus(status))
        }
    }

    // Handles

    fn open(&mut self, request: &CreateRequest<'_>) -> SmbResult<CreateResponse> {
        let response = self.call(SmbCommand::Create, &request.encode())?;
        CreateResponse::parse(&response.data)
    }

    fn close(&mut self, file_id: FileId) -> SmbResult<()> {
        self.call(SmbCommand::Close, &close_request(file_id))?;
        Ok(())
    }

    /// Open, run `f`, and close the handle whatever `f` returned.
    fn with_handle<T>(
        &mut self,
        request: &CreateRequest<'_>,
        f: impl FnOnce(&mut Self, &CreateResponse) -> SmbResult<T>,
    ) -> SmbResult<T> {
        let handle = self.open(request)?;
        let result = f(self, &handle);
        let closed = self.close(handle.file_id);
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    debug!("Closing SMB handle after failure also failed: {}", close_err);
                }
                Err(e)
            }
        }
    }

    fn set_info(&mut self, file_id: FileId, class: u8, info: &[u8]) -> SmbResult<()> {
        self.call(SmbCommand::SetInfo, &set_info_request(file_id, class, info))?;
        Ok(())
    }

    // File operations. Paths are share-relative and backslash-separated.

    /// Entries of a directory, without `.` and `..`, sorted by name.
    pub fn list_directory(&mut self, path: &str) -> SmbResult<Vec<DirectoryEntry>> {
        let request = CreateRequest {
            name: path,
            desired_access: DesiredAccess::FILE_LIST_DIRECTORY
                | DesiredAccess::FILE_READ_ATTRIBUTES
                | DesiredAccess::SYNCHRONIZE,
            file_attributes: 0,
            share_access: ShareAccess::ALL,
            disposition: CreateDisposition::Open,
            options: CreateOptions::DIRECTORY_FILE,
        };
        let output_len = self.max_transact_size;

        let mut entries = self.with_handle(&request, |client, handle| {
            let mut entries = Vec::new();
            let mut restart = true;
            loop {
                let body = query_directory_request(handle.file_id, "*", restart, output_len);
                restart = false;
                let response = client.call_with(
                    SmbCommand::QueryDirectory,
                    &body,
                    &[NtStatus::NO_MORE_FILES],
                )?;
                if response.header.status == NtStatus::NO_MORE_FILES {
                    break;
                }
                let batch = parse_directory_entries(parse_query_directory_response(&response.data)?)?;
                if batch.is_empty() {
                    break;
                }
                entries.extend(batch);
            }
            Ok(entries)
        })?;

        entries.retain(|e| e.name != "." && e.name != "..");
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn stat(&mut self, path: &str) -> SmbResult<DirectoryEntry> {
        let request = CreateRequest {
            name: path,
            desired_access: DesiredAccess::FILE_READ_ATTRIBUTES,
            file_attributes: 0,
            share_access: ShareAccess::ALL,
            disposition: CreateDisposition::Open,
            options: 0,
        };
        let name = path.rsplit('\\').next().unwrap_or(path);
        self.with_handle(&request, |_, handle| Ok(DirectoryEntry::from((name, handle))))
    }

    pub fn exists(&mut self, path: &str) -> SmbResult<bool> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn read_file(&mut self, path: &str) -> SmbResult<Vec<u8>> {
        let request = CreateRequest {
            name: path,
            desired_access: DesiredAccess::GENERIC_READ,
            file_attributes: 0,
            share_access: ShareAccess::READ,
            disposition: CreateDisposition::Open,
            options: CreateOptions::NON_DIRECTORY_FILE,
        };
        let chunk = self.max_read_size;

        self.with_handle(&request, |client, handle| {
            // EndOfFile comes from the server; reserve at most a few chunks.
            let reserve = handle.end_of_file.min(u64::from(chunk) * 4);
            let mut data = Vec::with_capacity(usize::try_from(reserve).unwrap_or(0));
            loop {
                let body = read_request(handle.file_id, data.len() as u64, chunk);
                let response =
                    client.call_with(SmbCommand::Read, &body, &[NtStatus::END_OF_FILE])?;
                if response.header.status == NtStatus::END_OF_FILE {
                    break;
                }
                let payload = parse_read_response(&response.data)?;
                if payload.is_empty() {
                    break;
                }
                data.extend_from_slice(payload);
            }
            Ok(data)
        })
    }

    /// Write a whole file. `Create` fails when the file exists;
    /// `OverwriteIf` replaces it.
    pub fn write_file(
        &mut self,
        path: &str,
        data: &[u8],
        disposition: CreateDisposition,
    ) -> SmbResult<()> {
        let request = CreateRequest {
            name: path,
            desired_access: DesiredAccess::GENERIC_WRITE | DesiredAccess::FILE_READ_ATTRIBUTES,
            file_attributes: FileAttributes::NORMAL,
            share_access: ShareAccess::READ,
            disposition,
            options: CreateOptions::NON_DIRECTORY_FILE,
        };
        let chunk = self.max_write_size as usize;

        self.with_handle(&request, |client, handle| {
            let mut offset = 0usize;
            while offset < data.len() {
                let end = (offset + chunk).min(data.len());
                let body = write_request(handle.file_id, offset as u64, &data[offset..end]);
                let response = client.call(SmbCommand::Write, &body)?;
                let written = parse_write_response(&response.data)? as usize;
                if written == 0 {
                    return Err(SmbError::Protocol(format!(
                        "Server accepted no bytes at offset {}",
                        offset
                    )));
                }
                offset += written.min(end - offset);
            }
            Ok(())
        })
    }

    pub fn create_directory(&mut self, path: &str) -> SmbResult<()> {
        let request = CreateRequest {
            name: path,
            desired_access: DesiredAccess::FILE_READ_ATTRIBUTES | DesiredAccess::SYNCHRONIZE,
            file_attributes: FileAttributes::DIRECTORY,
            share_access: ShareAccess::ALL,
            disposition: CreateDisposition::Create,
            options: CreateOptions::DIRECTORY_FILE,
        };
        self.with_handle(&request, |_, _| Ok(()))
    }

    /// Create every missing directory along `path`.
    pub fn create_directory_all(&mut self, path: &str) -> SmbResult<()> {
        let mut current = String::new();
        for segment in path.split('\\').filter(|s| !s.is_empty()) {
            if !current.is_empty() {
                current.push('\\');
            }
            current.push_str(segment);
            match self.create_directory(&current) {
                Ok(()) => debug!("Created SMB directory {}", current),
                Err(e) if e.status() == Some(NtStatus::OBJECT_NAME_COLLISION) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete a file, or an empty directory when `directory` is set.
    pub fn delete(&mut self, path: &str, directory: bool) -> SmbResult<()> {
        let request = CreateRequest {
            name: path,
            desired_access: DesiredAccess::DELETE | DesiredAccess::FILE_READ_ATTRIBUTES,
            file_attributes: 0,
            share_access: ShareAccess::ALL,
            disposition: CreateDisposition::Open,
            options: if directory {
                CreateOptions::DIRECTORY_FILE
            } else {
                CreateOptions::NON_DIRECTORY_FILE
            },
        };
        self.with_handle(&request, |client, handle| {
            client.set_info(
                handle.file_id,
                FileInfoClass::DISPOSITION_INFORMATION,
                &disposition_information(true),
            )
        })
    }

    /// Delete a directory and everything below it, depth first.
    pub fn delete_tree(&mut self, path: &str) -> SmbResult<()> {
        for entry in self.list_directory(path)? {
            let child = format!("{}\\{}", path, entry.name);
            if entry.is_directory() {
                self.delete_tree(&child)?;
            } else {
                self.delete(&child, false)?;
            }
        }
        self.delete(path, true)
    }

    pub fn rename(&mut self, source: &str, destination: &str, replace: bool) -> SmbResult<()> {
        let request = CreateRequest {
            name: source,
            desired_access: DesiredAccess::DELETE
                | DesiredAccess::FILE_READ_ATTRIBUTES
                | DesiredAccess::SYNCHRONIZE,
            file_attributes: 0,
            share_access: ShareAccess::ALL,
            disposition: CreateDisposition::Open,
            options: 0,
        };
        let info = rename_information(destination, replace);
        self.with_handle(&request, |client, handle| {
            client.set_info(handle.file_id, FileInfoClass::RENAME_INFORMATION, &info)
        })
    }
}

/// Whether the error means the path does not exist.
pub fn is_missing(err: &SmbError) -> bool {
    matches!(
        err.status(),
        Some(NtStatus::NO_SUCH_FILE | NtStatus::OBJECT_NAME_NOT_FOUND | NtStatus::OBJECT_PATH_NOT_FOUND)
    )
}

fn open_stream(host: &str, port: u16, timeout: Duration) -> SmbResult<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                debug!("Connecting to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => SmbError::Io(e),
        None => SmbError::Protocol(format!("{} did not resolve to any address", host)),
    })
}

/// SMB 2.x message signature: truncated HMAC-SHA256 over the message with
/// a zeroed signature field.
pub fn sign(key: &[u8; 16], message: &[u8]) -> SmbResult<[u8; 16]> {
    if message.len() < SMB2_HEADER_SIZE {
        return Err(SmbError::Protocol("Cannot sign a truncated message".to_string()));
    }
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| SmbError::Protocol("Invalid signing key".to_string()))?;
    mac.update(&message[..SIGNATURE_RANGE.start]);
    mac.update(&[0u8; 16]);
    mac.update(&message[SIGNATURE_RANGE.end..]);
    let digest = mac.finalize().into_bytes();
    let mut signature = [0u8; 16];
    signature.copy_from_slice(&digest[..16]);
    Ok(signature)
}
