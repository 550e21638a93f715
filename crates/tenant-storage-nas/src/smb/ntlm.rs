//! NTLM authentication messages (NTLMv2 and legacy NTLMv1).
//!
//! Key exchange is never negotiated, so the session key handed to SMB
//! signing is the key-exchange key derived from the password.

use bytes::{Buf, BufMut, BytesMut};
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

use super::error::{SmbError, SmbResult};
use super::protocol::utf16le;

type HmacMd5 = Hmac<Md5>;

pub const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const MESSAGE_NEGOTIATE: u32 = 1;
const MESSAGE_CHALLENGE: u32 = 2;
const MESSAGE_AUTHENTICATE: u32 = 3;

/// AV pair ids inside the challenge's target info.
const AV_EOL: u16 = 0x0000;
const AV_TIMESTAMP: u16 = 0x0007;

pub struct NegotiateFlags;

impl NegotiateFlags {
    pub const UNICODE: u32 = 0x0000_0001;
    pub const REQUEST_TARGET: u32 = 0x0000_0004;
    pub const SIGN: u32 = 0x0000_0010;
    pub const NTLM: u32 = 0x0000_0200;
    pub const ALWAYS_SIGN: u32 = 0x0000_8000;
    pub const EXTENDED_SESSION_SECURITY: u32 = 0x0008_0000;
    pub const TARGET_INFO: u32 = 0x0080_0000;
    pub const NEGOTIATE_128: u32 = 0x2000_0000;
    pub const NEGOTIATE_56: u32 = 0x8000_0000;

    pub const CLIENT: u32 = Self::UNICODE
        | Self::REQUEST_TARGET
        | Self::SIGN
        | Self::NTLM
        | Self::ALWAYS_SIGN
        | Self::EXTENDED_SESSION_SECURITY
        | Self::TARGET_INFO
        | Self::NEGOTIATE_128
        | Self::NEGOTIATE_56;
}

/// Account used for authentication.
#[derive(Clone)]
pub struct Credentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub domain: &'a str,
    pub workstation: &'a str,
}

/// Type 1 message opening the exchange.
pub fn negotiate_message() -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(32);
    buf.put_slice(NTLMSSP_SIGNATURE);
    buf.put_u32_le(MESSAGE_NEGOTIATE);
    buf.put_u32_le(NegotiateFlags::CLIENT);
    buf.put_bytes(0, 8); // DomainNameFields
    buf.put_bytes(0, 8); // WorkstationFields
    buf.to_vec()
}

/// Type 2 message sent by the server.
#[derive(Debug, Clone)]
pub struct ChallengeMessage {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

impl ChallengeMessage {
    pub fn parse(data: &[u8]) -> SmbResult<Self> {
        if data.len() < 48 || &data[0..8] != NTLMSSP_SIGNATURE {
            return Err(SmbError::AuthFailed("Malformed NTLM challenge".to_string()));
        }
        let mut buf = &data[8..];
        if buf.get_u32_le() != MESSAGE_CHALLENGE {
            return Err(SmbError::AuthFailed("Expected an NTLM challenge message".to_string()));
        }
        buf.advance(8); // TargetNameFields
        let flags = buf.get_u32_le();
        let mut server_challenge = [0u8; 8];
        buf.copy_to_slice(&mut server_challenge);
        buf.advance(8); // Reserved
        let info_len = buf.get_u16_le() as usize;
        let _info_max = buf.get_u16_le();
        let info_offset = buf.get_u32_le() as usize;

        let target_info = if info_len == 0 {
            Vec::new()
        } else {
            data.get(info_offset..info_offset + info_len)
                .ok_or_else(|| {
                    SmbError::AuthFailed("NTLM target info lies outside the challenge".to_string())
                })?
                .to_vec()
        };

        Ok(Self {
            flags,
            server_challenge,
            target_info,
        })
    }

    /// Server time from the target info, as a FILETIME.
    pub fn timestamp(&self) -> Option<u64> {
        let mut buf = self.target_info.as_slice();
        while buf.remaining() >= 4 {
            let id = buf.get_u16_le();
            let len = buf.get_u16_le() as usize;
            if id == AV_EOL || buf.remaining() < len {
                return None;
            }
            if id == AV_TIMESTAMP && len == 8 {
                return Some(buf.get_u64_le());
            }
            buf.advance(len);
        }
        None
    }
}

/// Type 3 message plus the key used to sign the session.
#[derive(Debug, Clone)]
pub struct Authentication {
    pub message: Vec<u8>,
    pub session_key: [u8; 16],
}

/// Answer a challenge.
///
/// `client_challenge` must be fresh random bytes; `now` is the current time
/// as a FILETIME, used when the server does not supply one.
pub fn authenticate(
    challenge: &ChallengeMessage,
    credentials: &Credentials<'_>,
    use_ntlm_v2: bool,
    client_challenge: [u8; 8],
    now: u64,
) -> SmbResult<Authentication> {
    let (lm_response, nt_response, session_key) = if use_ntlm_v2 {
        let key = ntowf_v2(credentials.password, credentials.username, credentials.domain)?;
        let (timestamp, lm) = match challenge.timestamp() {
            // With a server timestamp the LMv2 response is sent empty.
            Some(ts) => (ts, vec![0u8; 24]),
            None => (
                now,
                lmv2_response(&key, &challenge.server_challenge, &client_challenge)?.to_vec(),
            ),
        };
        let (nt, session_base_key) = ntlmv2_response(
            &key,
            &challenge.server_challenge,
            &client_challenge,
            timestamp,
            &challenge.target_info,
        )?;
        (lm, nt, session_base_key)
    } else {
        let hash = nt_hash(credentials.password);
        let session_base_key: [u8; 16] = Md4::digest(hash).into();
        if challenge.flags & NegotiateFlags::EXTENDED_SESSION_SECURITY != 0 {
            let mut lm = client_challenge.to_vec();
            lm.resize(24, 0);
            let mut md5 = Md5::new();
            md5.update(challenge.server_challenge);
            md5.update(client_challenge);
            let mut block = [0u8; 8];
            block.copy_from_slice(&md5.finalize()[..8]);
            let nt = desl(&hash, &block)?;
            let key = hmac_md5(&session_base_key, &[&challenge.server_challenge, &lm[..8]])?;
            (lm, nt.to_vec(), key)
        } else {
            let nt = desl(&hash, &challenge.server_challenge)?;
            (nt.to_vec(), nt.to_vec(), session_base_key)
        }
    };

    let flags = (challenge.flags & NegotiateFlags::CLIENT) | NegotiateFlags::UNICODE;
    let domain = utf16le(credentials.domain);
    let user = utf16le(credentials.username);
    let workstation = utf16le(credentials.workstation);

    let payloads: [&[u8]; 6] = [&lm_response, &nt_response, &domain, &user, &workstation, &[]];
    let mut buf = BytesMut::with_capacity(64 + payloads.iter().map(|p| p.len()).sum::<usize>());
    buf.put_slice(NTLMSSP_SIGNATURE);
    buf.put_u32_le(MESSAGE_AUTHENTICATE);
    let mut offset = 64u32;
    for payload in payloads {
        buf.put_u16_le(payload.len() as u16);
        buf.put_u16_le(payload.len() as u16);
        buf.put_u32_le(offset);
        offset += payload.len() as u32;
    }
    buf.put_u32_le(flags);
    for payload in payloads {
        buf.put_slice(payload);
    }

    Ok(Authentication {
        message: buf.to_vec(),
        session_key,
    })
}

/// NTOWFv1: MD4 of the UTF-16LE password.
pub fn nt_hash(password: &str) -> [u8; 16] {
    Md4::digest(utf16le(password)).into()
}

/// NTOWFv2 keyed on the upper-cased user name and the domain.
pub fn ntowf_v2(password: &str, username: &str, domain: &str) -> SmbResult<[u8; 16]> {
    let identity = utf16le(&format!("{}{}", username.to_uppercase(), domain));
    hmac_md5(&nt_hash(password), &[&identity])
}

/// NTLMv2 response and the session base key derived from it.
pub fn ntlmv2_response(
    ntowf: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> SmbResult<(Vec<u8>, [u8; 16])> {
    let mut blob = BytesMut::with_capacity(32 + target_info.len());
    blob.put_u8(1); // RespType
    blob.put_u8(1); // HiRespType
    blob.put_bytes(0, 6);
    blob.put_u64_le(timestamp);
    blob.put_slice(client_challenge);
    blob.put_bytes(0, 4);
    blob.put_slice(target_info);
    blob.put_bytes(0, 4);

    let proof = hmac_md5(ntowf, &[server_challenge, &blob])?;
    let session_base_key = hmac_md5(ntowf, &[&proof])?;

    let mut response = proof.to_vec();
    response.extend_from_slice(&blob);
    Ok((response, session_base_key))
}

pub fn lmv2_response(
    ntowf: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
) -> SmbResult<[u8; 24]> {
    let proof = hmac_md5(ntowf, &[server_challenge, client_challenge])?;
    let mut response = [0u8; 24];
    response[..16].copy_from_slice(&proof);
    response[16..].copy_from_slice(client_challenge);
    Ok(response)
}

/// DESL: the 16-byte key split into three DES keys over the same block.
pub fn desl(key: &[u8; 16], data: &[u8; 8]) -> SmbResult<[u8; 24]> {
    let mut padded = [0u8; 21];
    padded[..16].copy_from_slice(key);
    let mut out = [0u8; 24];
    for (i, chunk) in padded.chunks(7).enumerate() {
        let cipher = Des::new_from_slice(&expand_des_key(chunk))
            .map_err(|_| SmbError::AuthFailed("Invalid DES key".to_string()))?;
        let mut block = GenericArray::from(*data);
        cipher.encrypt_block(&mut block);
        out[i * 8..(i + 1) * 8].copy_from_slice(&block);
    }
    Ok(out)
}

/// Spread 56 key bits over 8 bytes, leaving the parity bit clear.
fn expand_des_key(key: &[u8]) -> [u8; 8] {
    let k = |i: usize| key.get(i).copied().unwrap_or(0);
    [
        k(0) & 0xFE,
        (k(0) << 7) | (k(1) >> 1),
        (k(1) << 6) | (k(2) >> 2),
        (k(2) << 5) | (k(3) >> 3),
        (k(3) << 4) | (k(4) >> 4),
        (k(4) << 3) | (k(5) >> 5),
        (k(5) << 2) | (k(6) >> 6),
        k(6) << 1,
    ]
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> SmbResult<[u8; 16]> {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key)
        .map_err(|_| SmbError::AuthFailed("Invalid HMAC key".to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_CHALLENGE: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
    const CLIENT_CHALLENGE: [u8; 8] = [0xaa; 8];

    fn target_info() -> Vec<u8> {
        let mut info = Vec::new();
        info.extend_from_slice(&[0x02, 0x00, 0x0c, 0x00]);
        info.extend_from_slice(&utf16le("Domain"));
        info.extend_from_slice(&[0x01, 0x00, 0x0c, 0x00]);
        info.extend_from_slice(&utf16le("Server"));
        info.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        info
    }

    #[test]
    fn test_nt_hash() {
        assert_eq!(hex::encode(nt_hash("Password")), "a4f49c406510bdcab6824ee7c30fd852");
    }

    #[test]
    fn test_ntlmv1_response() {
        let response = desl(&nt_hash("Password"), &SERVER_CHALLENGE).unwrap();
        assert_eq!(
            hex::encode(response),
            "67c43011f30298a2ad35ece64f16331c44bdbed927841f94"
        );
        let session_base_key: [u8; 16] = Md4::digest(nt_hash("Password")).into();
        assert_eq!(hex::encode(session_base_key), "d87262b0cde4b1cb7499becccdf10784");
    }

    #[test]
    fn test_ntowf_v2() {
        let key = ntowf_v2("Password", "User", "Domain").unwrap();
        assert_eq!(hex::encode(key), "0c868a403bfd7a93a3001ef22ef02e3f");
    }

    #[test]
    fn test_lmv2_response() {
        let key = ntowf_v2("Password", "User", "Domain").unwrap();
        let lm = lmv2_response(&key, &SERVER_CHALLENGE, &CLIENT_CHALLENGE).unwrap();
        assert_eq!(
            hex::encode(lm),
            "86c35097ac9cec102554764a57cccc19aaaaaaaaaaaaaaaa"
        );
    }

    #[test]
    fn test_ntlmv2_response() {
        let key = ntowf_v2("Password", "User", "Domain").unwrap();
        let (response, session_base_key) =
            ntlmv2_response(&key, &SERVER_CHALLENGE, &CLIENT_CHALLENGE, 0, &target_info())
                .unwrap();
        assert_eq!(hex::encode(&response[..16]), "68cd0ab851e51c96aabc927bebef6a1c");
        assert_eq!(hex::encode(session_base_key), "8de40ccadbc14a82f15cb0ad0de95ca3");
        assert_eq!(&response[16..18], &[1, 1]);
        assert_eq!(&response[32..40], &CLIENT_CHALLENGE);
    }

    fn challenge_bytes(flags: u32, info: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_slice(NTLMSSP_SIGNATURE);
        buf.put_u32_le(MESSAGE_CHALLENGE);
        buf.put_bytes(0, 8);
        buf.put_u32_le(flags);
        buf.put_slice(&SERVER_CHALLENGE);
        buf.put_bytes(0, 8);
        buf.put_u16_le(info.len() as u16);
        buf.put_u16_le(info.len() as u16);
        buf.put_u32_le(48);
        buf.put_slice(info);
        buf.to_vec()
    }

    #[test]
    fn test_parse_challenge_and_timestamp() {
        let mut info = vec![0x07, 0x00, 0x08, 0x00];
        info.extend_from_slice(&0x01D0_0000_0000_0000u64.to_le_bytes());
        info.extend_from_slice(&[0, 0, 0, 0]);

        let parsed = ChallengeMessage::parse(&challenge_bytes(NegotiateFlags::CLIENT, &info)).unwrap();
        assert_eq!(parsed.server_challenge, SERVER_CHALLENGE);
        assert_eq!(parsed.timestamp(), Some(0x01D0_0000_0000_0000));

        let without = ChallengeMessage::parse(&challenge_bytes(0, &target_info())).unwrap();
        assert_eq!(without.timestamp(), None);

        assert!(ChallengeMessage::parse(b"NTLMSSP\0short").is_err());
        assert!(ChallengeMessage::parse(&negotiate_message()).is_err());
    }

    #[test]
    fn test_authenticate_message_layout() {
        let challenge = ChallengeMessage::parse(&challenge_bytes(
            NegotiateFlags::CLIENT,
            &target_info(),
        ))
        .unwrap();
        let creds = Credentials {
            username: "User",
            password: "Password",
            domain: "Domain",
            workstation: "WS",
        };
        let auth = authenticate(&challenge, &creds, true, CLIENT_CHALLENGE, 0).unwrap();
        let msg = &auth.message;
        assert_eq!(&msg[0..8], NTLMSSP_SIGNATURE);
        assert_eq!(&msg[8..12], &3u32.to_le_bytes());

        let field = |at: usize| {
            let len = u16::from_le_bytes([msg[at], msg[at + 1]]) as usize;
            let off = u32::from_le_bytes([msg[at + 4], msg[at + 5], msg[at + 6], msg[at + 7]])
                as usize;
            &msg[off..off + len]
        };
        assert_eq!(field(20)[..16], hex::decode("68cd0ab851e51c96aabc927bebef6a1c").unwrap()[..]);
        assert_eq!(field(28), utf16le("Domain").as_slice());
        assert_eq!(field(36), utf16le("User").as_slice());
        assert_eq!(field(44), utf16le("WS").as_slice());
        assert!(field(52).is_empty());
        assert_eq!(hex::encode(auth.session_key), "8de40ccadbc14a82f15cb0ad0de95ca3");
    }

    #[test]
    fn test_authenticate_v1_plain() {
        let challenge = ChallengeMessage::parse(&challenge_bytes(
            NegotiateFlags::UNICODE | NegotiateFlags::NTLM,
            &[],
        ))
        .unwrap();
        let creds = Credentials {
            username: "User",
            password: "Password",
            domain: "Domain",
            workstation: "",
        };
        let auth = authenticate(&challenge, &creds, false, CLIENT_CHALLENGE, 0).unwrap();
        let nt_offset = u32::from_le_bytes(auth.message[24..28].try_into().unwrap()) as usize;
        assert_eq!(
            hex::encode(&auth.message[nt_offset..nt_offset + 24]),
            "67c43011f30298a2ad35ece64f16331c44bdbed927841f94"
        );
    }
}
