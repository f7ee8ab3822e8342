//! RTMP 1.0 handshake: both the legacy "simple" exchange and the
//! digest-based scheme used by Flash Media Server and every modern
//! publisher/player.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use derive_more::{Display, From};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

type HmacSha256 = Hmac<Sha256>;

const HANDSHAKE_SIZE: usize = 1536;
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(3);
const DIGEST_SCHEME_2_BASE: usize = 772;
const DIGEST_SCHEME_1_BASE: usize = 8;

/// `"Genuine Adobe Flash Player 001"` followed by Adobe's 32-byte constant.
/// The first 30 bytes (the string alone) are the "partial" key used to
/// locate and validate a digest; the full 62 bytes sign the S2 response.
const FP_KEY: [u8; 62] = [
    b'G', b'e', b'n', b'u', b'i', b'n', b'e', b' ', b'A', b'd', b'o', b'b', b'e', b' ', b'F', b'l', b'a', b's', b'h',
    b' ', b'P', b'l', b'a', b'y', b'e', b'r', b' ', b'0', b'0', b'1', 0xf0, 0xee, 0xc2, 0x4a, 0x80, 0x68, 0xbe, 0xe8,
    0x2e, 0x00, 0xd0, 0xd1, 0x02, 0x9e, 0x7e, 0x57, 0x6e, 0xec, 0x5d, 0x2d, 0x29, 0x80, 0x6f, 0xab, 0x93, 0xb8, 0xe6,
    0x36, 0xcf, 0xeb, 0x31, 0xae,
];

/// `"Genuine Adobe Flash Media Server 001"` followed by the same tail.
/// The first 36 bytes are the server's partial key, used for S1's digest.
const FMS_KEY: [u8; 68] = [
    b'G', b'e', b'n', b'u', b'i', b'n', b'e', b' ', b'A', b'd', b'o', b'b', b'e', b' ', b'F', b'l', b'a', b's', b'h',
    b' ', b'M', b'e', b'd', b'i', b'a', b' ', b'S', b'e', b'r', b'v', b'e', b'r', b' ', b'0', b'0', b'1', 0xf0, 0xee,
    0xc2, 0x4a, 0x80, 0x68, 0xbe, 0xe8, 0x2e, 0x00, 0xd0, 0xd1, 0x02, 0x9e, 0x7e, 0x57, 0x6e, 0xec, 0x5d, 0x2d, 0x29,
    0x80, 0x6f, 0xab, 0x93, 0xb8, 0xe6, 0x36, 0xcf, 0xeb, 0x31, 0xae,
];

#[derive(Debug, Display, From)]
pub enum HandshakeError {
    #[display(fmt = "handshake io error: {_0}")]
    Io(std::io::Error),
    #[display(fmt = "unsupported handshake version {_0}")]
    UnsupportedVersion(u8),
    #[display(fmt = "no valid digest found at either scheme offset")]
    DigestNotFound,
    #[display(fmt = "C2 did not echo the S1 we sent")]
    InvalidSimpleAck,
    #[display(fmt = "handshake did not complete within the deadline")]
    Timeout,
}

impl std::error::Error for HandshakeError {}

fn now_u32() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

fn make_digest(key: &[u8], src: &[u8], gap: usize) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    if gap > 0 {
        mac.update(&src[..gap]);
        mac.update(&src[gap + 32..]);
    } else {
        mac.update(src);
    }
    mac.finalize().into_bytes().into()
}

fn digest_position(buf: &[u8], base: usize) -> usize {
    let sum: u32 = buf[base..base + 4].iter().map(|&b| b as u32).sum();
    (sum % 728) as usize + base + 4
}

fn find_digest(buf: &[u8], peer_partial_key: &[u8], base: usize) -> Option<usize> {
    let pos = digest_position(buf, base);
    if pos + 32 > buf.len() {
        return None;
    }
    let computed = make_digest(peer_partial_key, buf, pos);
    if computed == buf[pos..pos + 32] {
        Some(pos)
    } else {
        None
    }
}

/// Runs the server side of the handshake to completion: reads C0/C1,
/// replies with S0/S1/S2, and reads the peer's C2. Every read and write
/// shares one 3-second deadline for the whole exchange.
pub async fn server_handshake<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(HANDSHAKE_DEADLINE, run_server_handshake(stream))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

async fn run_server_handshake<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut c0 = [0u8; 1];
    stream.read_exact(&mut c0).await?;
    if c0[0] != 3 {
        return Err(HandshakeError::UnsupportedVersion(c0[0]));
    }

    let mut c1 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c1).await?;

    let is_simple = c1[4..8].iter().all(|&b| b == 0);

    if is_simple {
        server_simple_handshake(stream, &c1).await
    } else {
        server_digest_handshake(stream, &c1).await
    }
}

async fn server_simple_handshake<S>(stream: &mut S, c1: &[u8; HANDSHAKE_SIZE]) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut s1 = vec![0u8; HANDSHAKE_SIZE];
    rand::thread_rng().fill_bytes(&mut s1);
    s1[0..4].copy_from_slice(&c1[0..4]);
    s1[4..8].copy_from_slice(&[0, 0, 0, 0]);

    let mut s2 = vec![0u8; HANDSHAKE_SIZE];
    s2[0..4].copy_from_slice(&c1[0..4]);
    s2[4..8].copy_from_slice(&[0, 0, 0, 0]);
    s2[8..].copy_from_slice(&c1[8..]);

    stream.write_all(&[3]).await?;
    stream.write_all(&s1).await?;
    stream.write_all(&s2).await?;

    let mut c2 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c2).await?;

    if c2[0..4] != s1[0..4] || c2[8..] != s1[8..] {
        return Err(HandshakeError::InvalidSimpleAck);
    }

    Ok(())
}

async fn server_digest_handshake<S>(stream: &mut S, c1: &[u8; HANDSHAKE_SIZE]) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_partial = &FP_KEY[..30];
    let server_partial = &FMS_KEY[..36];

    let client_digest_pos = find_digest(c1, client_partial, DIGEST_SCHEME_2_BASE)
        .or_else(|| find_digest(c1, client_partial, DIGEST_SCHEME_1_BASE))
        .ok_or(HandshakeError::DigestNotFound)?;
    let client_digest = c1[client_digest_pos..client_digest_pos + 32].to_vec();

    let mut s1 = vec![0u8; HANDSHAKE_SIZE];
    rand::thread_rng().fill_bytes(&mut s1);
    s1[0..4].copy_from_slice(&now_u32().to_be_bytes());
    s1[4..8].copy_from_slice(&[0, 0, 0, 0]);

    let s1_pos = digest_position(&s1, DIGEST_SCHEME_1_BASE);
    let s1_digest = make_digest(server_partial, &s1, s1_pos);
    s1[s1_pos..s1_pos + 32].copy_from_slice(&s1_digest);

    let mut s2 = vec![0u8; HANDSHAKE_SIZE];
    rand::thread_rng().fill_bytes(&mut s2);
    let digest_key = make_digest(client_partial, &client_digest, 0);
    let signature = make_digest(&digest_key, &s2[..HANDSHAKE_SIZE - 32], 0);
    s2[HANDSHAKE_SIZE - 32..].copy_from_slice(&signature);

    stream.write_all(&[3]).await?;
    stream.write_all(&s1).await?;
    stream.write_all(&s2).await?;

    let mut c2 = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c2).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_digest_c1(time: u32, base: usize) -> Vec<u8> {
        let mut c1 = vec![0u8; HANDSHAKE_SIZE];
        rand::thread_rng().fill_bytes(&mut c1);
        c1[0..4].copy_from_slice(&time.to_be_bytes());
        c1[4..8].copy_from_slice(&[0x80, 0x00, 0x07, 0x02]); // nonzero => digest scheme

        let pos = digest_position(&c1, base);
        let digest = make_digest(&FP_KEY[..30], &c1, pos);
        c1[pos..pos + 32].copy_from_slice(&digest);
        c1
    }

    #[test]
    fn finds_a_valid_scheme2_digest() {
        let c1 = client_digest_c1(12345, DIGEST_SCHEME_2_BASE);
        let pos = find_digest(&c1, &FP_KEY[..30], DIGEST_SCHEME_2_BASE);
        assert!(pos.is_some());
        assert!(find_digest(&c1, &FP_KEY[..30], DIGEST_SCHEME_1_BASE).is_none());
    }

    #[test]
    fn finds_a_valid_scheme1_digest_when_scheme2_fails() {
        let c1 = client_digest_c1(54321, DIGEST_SCHEME_1_BASE);
        assert!(find_digest(&c1, &FP_KEY[..30], DIGEST_SCHEME_2_BASE).is_none());
        assert!(find_digest(&c1, &FP_KEY[..30], DIGEST_SCHEME_1_BASE).is_some());
    }

    #[tokio::test]
    async fn digest_handshake_s1_digest_and_s2_signature_validate_against_client_partial_key() {
        let (mut client, mut server) = tokio::io::duplex(HANDSHAKE_SIZE * 4);

        let server_task = tokio::spawn(async move { server_handshake(&mut server).await });

        let c1 = client_digest_c1(0xaabbccdd, DIGEST_SCHEME_2_BASE);
        let client_digest_pos = find_digest(&c1, &FP_KEY[..30], DIGEST_SCHEME_2_BASE).unwrap();
        let client_digest = c1[client_digest_pos..client_digest_pos + 32].to_vec();

        client.write_all(&[3]).await.unwrap();
        client.write_all(&c1).await.unwrap();

        let mut s0 = [0u8; 1];
        client.read_exact(&mut s0).await.unwrap();
        assert_eq!(s0[0], 3);

        let mut s1 = vec![0u8; HANDSHAKE_SIZE];
        client.read_exact(&mut s1).await.unwrap();

        // S1's embedded digest must validate against the server partial key.
        let s1_pos = digest_position(&s1, DIGEST_SCHEME_1_BASE);
        let expected_s1_digest = make_digest(&FMS_KEY[..36], &s1, s1_pos);
        assert_eq!(&s1[s1_pos..s1_pos + 32], &expected_s1_digest[..]);

        let mut s2 = vec![0u8; HANDSHAKE_SIZE];
        client.read_exact(&mut s2).await.unwrap();

        // S2's trailing signature is keyed off the *30-byte* client partial
        // key, not the full 62-byte constant (property #4).
        let digest_key = make_digest(&FP_KEY[..30], &client_digest, 0);
        let expected_signature = make_digest(&digest_key, &s2[..HANDSHAKE_SIZE - 32], 0);
        assert_eq!(&s2[HANDSHAKE_SIZE - 32..], &expected_signature[..]);

        let mut c2 = vec![0u8; HANDSHAKE_SIZE];
        rand::thread_rng().fill_bytes(&mut c2);
        client.write_all(&c2).await.unwrap();

        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn simple_handshake_round_trips_over_an_in_memory_duplex() {
        let (mut client, mut server) = tokio::io::duplex(HANDSHAKE_SIZE * 4);

        let server_task = tokio::spawn(async move { server_handshake(&mut server).await });

        let mut c1 = vec![0u8; HANDSHAKE_SIZE];
        rand::thread_rng().fill_bytes(&mut c1);
        c1[4..8].copy_from_slice(&[0, 0, 0, 0]); // force simple handshake

        client.write_all(&[3]).await.unwrap();
        client.write_all(&c1).await.unwrap();

        let mut s0 = [0u8; 1];
        client.read_exact(&mut s0).await.unwrap();
        assert_eq!(s0[0], 3);

        let mut s1 = vec![0u8; HANDSHAKE_SIZE];
        client.read_exact(&mut s1).await.unwrap();
        assert_eq!(&s1[0..4], &c1[0..4]);

        let mut s2 = vec![0u8; HANDSHAKE_SIZE];
        client.read_exact(&mut s2).await.unwrap();
        assert_eq!(&s2[0..4], &c1[0..4]);
        assert_eq!(&s2[8..], &c1[8..]);

        let mut c2 = vec![0u8; HANDSHAKE_SIZE];
        c2[0..4].copy_from_slice(&s1[0..4]);
        c2[8..].copy_from_slice(&s1[8..]);
        client.write_all(&c2).await.unwrap();

        server_task.await.unwrap().unwrap();
    }
}
