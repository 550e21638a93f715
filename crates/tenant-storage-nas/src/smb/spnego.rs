//! Minimal SPNEGO (RFC 4178) framing around NTLM tokens.

use super::error::{SmbError, SmbResult};
use super::ntlm::NTLMSSP_SIGNATURE;

/// 1.3.6.1.5.5.2
const SPNEGO_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x02];
/// 1.3.6.1.4.1.311.2.2.10
const NTLMSSP_OID: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x02, 0x02, 0x0a];

fn der_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else if len <= 0xFF {
        vec![0x81, len as u8]
    } else {
        vec![0x82, (len >> 8) as u8, len as u8]
    }
}

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(der_length(content.len()));
    out.extend_from_slice(content);
    out
}

/// NegTokenInit offering NTLM and carrying the NTLM negotiate message.
pub fn wrap_negotiate(ntlm_token: &[u8]) -> Vec<u8> {
    let mech_types = der(0xa0, &der(0x30, &der(0x06, NTLMSSP_OID)));
    let mech_token = der(0xa2, &der(0x04, ntlm_token));

    let mut init = mech_types;
    init.extend(mech_token);
    let neg_token_init = der(0xa0, &der(0x30, &init));

    let mut body = der(0x06, SPNEGO_OID);
    body.extend(neg_token_init);
    der(0x60, &body)
}

/// NegTokenResp carrying the NTLM authenticate message.
pub fn wrap_authenticate(ntlm_token: &[u8]) -> Vec<u8> {
    der(0xa1, &der(0x30, &der(0xa2, &der(0x04, ntlm_token))))
}

/// The NTLM message inside a server security blob.
///
/// Servers answer with a NegTokenResp; some send the raw NTLM message. The
/// NTLM message carries its own offsets, so everything from its signature
/// onwards is returned.
pub fn extract_ntlm_token(blob: &[u8]) -> SmbResult<&[u8]> {
    blob.windows(NTLMSSP_SIGNATURE.len())
        .position(|w| w == NTLMSSP_SIGNATURE)
        .map(|at| &blob[at..])
        .ok_or_else(|| SmbError::AuthFailed("Server did not send an NTLM challenge".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_der_lengths() {
        assert_eq!(der_length(5), vec![5]);
        assert_eq!(der_length(0x80), vec![0x81, 0x80]);
        assert_eq!(der_length(0x1234), vec![0x82, 0x12, 0x34]);
    }

    #[test]
    fn test_negotiate_wrapper() {
        let token = b"NTLMSSP\0\x01\x00\x00\x00";
        let wrapped = wrap_negotiate(token);
        assert_eq!(wrapped[0], 0x60);
        assert_eq!(wrapped[1] as usize, wrapped.len() - 2);
        assert_eq!(&wrapped[2..4], &[0x06, 0x06]);
        assert_eq!(&wrapped[4..10], SPNEGO_OID);
        assert!(wrapped.windows(NTLMSSP_OID.len()).any(|w| w == NTLMSSP_OID));
        assert!(wrapped.ends_with(token));
    }

    #[test]
    fn test_authenticate_wrapper_long_token() {
        let token = vec![0x42u8; 300];
        let wrapped = wrap_authenticate(&token);
        assert_eq!(&wrapped[0..2], &[0xa1, 0x82]);
        let len = u16::from_be_bytes([wrapped[2], wrapped[3]]) as usize;
        assert_eq!(len, wrapped.len() - 4);
        assert!(wrapped.ends_with(&token));
    }

    #[test]
    fn test_extract_token() {
        let challenge = b"NTLMSSP\0\x02\x00\x00\x00rest";
        let blob = wrap_authenticate(challenge);
        assert_eq!(extract_ntlm_token(&blob).unwrap(), &challenge[..]);
        assert_eq!(extract_ntlm_token(challenge).unwrap(), &challenge[..]);
        assert!(extract_ntlm_token(b"\xa1\x03\x0a\x01\x02").is_err());
    }
}
