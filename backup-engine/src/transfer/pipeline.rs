//! Streaming gzip + SHA-1 pipeline shared by every backend.
//!
//! The digest is always taken over the uncompressed bytes, so a file backed
//! up through one backend verifies the same way when restored through
//! another.

use super::TransferStat;
use crate::utils::errors::{EngineError, Result};
use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder};
use async_compression::Level;
use sha1::{Digest, Sha1};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};

#[derive(Default)]
struct TallyState {
    bytes: u64,
    hasher: Option<Sha1>,
}

/// Reader that counts, and optionally hashes, every byte passing through.
pub struct Tally<R> {
    inner: R,
    state: Arc<Mutex<TallyState>>,
}

/// Read-side view of a [`Tally`], usable after the reader has been moved
/// into an encoder or a request body.
#[derive(Clone)]
pub struct TallyProbe {
    state: Arc<Mutex<TallyState>>,
}

impl<R> Tally<R> {
    pub fn hashing(inner: R) -> (Self, TallyProbe) {
        Self::build(inner, Some(Sha1::new()))
    }

    pub fn counting(inner: R) -> (Self, TallyProbe) {
        Self::build(inner, None)
    }

    fn build(inner: R, hasher: Option<Sha1>) -> (Self, TallyProbe) {
        let state = Arc::new(Mutex::new(TallyState { bytes: 0, hasher }));
        let probe = TallyProbe {
            state: Arc::clone(&state),
        };
        (Self { inner, state }, probe)
    }
}

impl TallyProbe {
    pub fn bytes(&self) -> u64 {
        self.lock().bytes
    }

    /// Hex SHA-1 of everything read so far; empty for counting-only tallies.
    pub fn hex_digest(&self) -> String {
        self.lock()
            .hasher
            .as_ref()
            .map(|h| hex::encode(h.clone().finalize()))
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TallyState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Tally<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let fresh = &buf.filled()[before..];
        if !fresh.is_empty() {
            let mut state = this.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            state.bytes += fresh.len() as u64;
            if let Some(hasher) = state.hasher.as_mut() {
                hasher.update(fresh);
            }
        }
        Poll::Ready(Ok(()))
    }
}

/// Compressed reader over `src`; the probe reports the uncompressed size and
/// digest once the encoder has been drained.
pub fn encoder<R>(src: R, level: u32) -> (GzipEncoder<BufReader<Tally<R>>>, TallyProbe)
where
    R: AsyncRead + Unpin,
{
    let (tally, probe) = Tally::hashing(src);
    let encoder = GzipEncoder::with_quality(BufReader::new(tally), Level::Precise(level as i32));
    (encoder, probe)
}

/// Uncompressed reader over the gzip stream `src`. The first probe counts
/// compressed bytes, the second hashes the output.
pub fn decoder<R>(src: R) -> (Tally<GzipDecoder<BufReader<Tally<R>>>>, TallyProbe, TallyProbe)
where
    R: AsyncRead + Unpin,
{
    let (wire, wire_probe) = Tally::counting(src);
    let mut decoder = GzipDecoder::new(BufReader::new(wire));
    decoder.multiple_members(true);
    let (plain, plain_probe) = Tally::hashing(decoder);
    (plain, wire_probe, plain_probe)
}

/// Compress `src` into `dst`.
pub async fn compress<R, W>(src: R, dst: &mut W, level: u32) -> Result<TransferStat>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut encoder, probe) = encoder(src, level);
    let bsize = tokio::io::copy(&mut encoder, dst).await?;
    dst.shutdown().await?;

    Ok(TransferStat {
        size: probe.bytes() as i64,
        bsize: bsize as i64,
        sha1: probe.hex_digest(),
    })
}

/// Decompress the gzip stream `src` into `dst`.
pub async fn decompress<R, W>(src: R, dst: &mut W) -> Result<TransferStat>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut plain, wire, probe) = decoder(src);
    let size = tokio::io::copy(&mut plain, dst).await?;
    dst.shutdown().await?;

    Ok(TransferStat {
        size: size as i64,
        bsize: wire.bytes() as i64,
        sha1: probe.hex_digest(),
    })
}

/// Size and digest of a local file, without compressing it.
pub async fn digest_file(path: &Path) -> Result<(i64, String)> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| EngineError::from_io(e, path.display().to_string()))?;
    let (mut tally, probe) = Tally::hashing(file);
    tokio::io::copy(&mut tally, &mut tokio::io::sink()).await?;
    Ok((probe.bytes() as i64, probe.hex_digest()))
}

pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

pub async fn gzip(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let (mut encoder, _) = encoder(data, level);
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).await?;
    Ok(out)
}

pub async fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let (mut plain, _, _) = decoder(data);
    let mut out = Vec::new();
    plain.read_to_end(&mut out).await?;
    Ok(out)
}
