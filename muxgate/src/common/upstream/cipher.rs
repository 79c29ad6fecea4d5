// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Symmetric stream enciphering for upstream connections
//!
//! The enciphered variant frames the byte stream into AEAD chunks:
//! `u16-BE ciphertext length || ciphertext`, sealed with
//! ChaCha20-Poly1305 under per-direction keys derived from the shared
//! secret, with a little-endian counter nonce per chunk. Each side seals
//! with its own direction key, so counters never collide across
//! directions.

use chacha20poly1305::{
  aead::{Aead, KeyInit},
  ChaCha20Poly1305, Nonce,
};
use futures::future::{BoxFuture, FutureExt};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{UpstreamConnection, UpstreamError};

const TAG_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
/// Plaintext cap per chunk; the u16 length must also cover the AEAD tag.
const MAX_CHUNK: usize = 16 * 1024;

/// Cipher selection for a node binding's `method` field.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CipherMethod {
  None,
  ChaCha20IetfPoly1305,
}

impl CipherMethod {
  pub fn from_name(name: &str) -> Result<CipherMethod, UpstreamError> {
    match name {
      "" | "none" | "plain" => Ok(CipherMethod::None),
      "chacha20-ietf-poly1305" => Ok(CipherMethod::ChaCha20IetfPoly1305),
      other => Err(UpstreamError::UnsupportedCipher(other.to_owned())),
    }
  }
}

fn derive_key(secret: &str, direction: &str) -> [u8; 32] {
  let mut hasher = Sha256::new();
  hasher.update(secret.as_bytes());
  hasher.update(direction.as_bytes());
  hasher.finalize().into()
}

fn counter_nonce(counter: u64) -> Nonce {
  let mut nonce = [0u8; NONCE_SIZE];
  nonce[..8].copy_from_slice(&counter.to_le_bytes());
  Nonce::from(nonce)
}

fn aead_error() -> std::io::Error {
  std::io::Error::new(std::io::ErrorKind::InvalidData, "AEAD chunk verification failed")
}

/// A byte stream enciphered in AEAD chunks, from the dialing side's
/// perspective: writes seal with the uplink key, reads open with the
/// downlink key.
pub struct CipherStream<S> {
  inner: S,
  sealer: ChaCha20Poly1305,
  opener: ChaCha20Poly1305,
  seal_counter: u64,
  open_counter: u64,
  // Decrypted bytes not yet handed to the caller
  plaintext: Vec<u8>,
  plaintext_offset: usize,
}

impl<S> CipherStream<S> {
  pub fn new(inner: S, secret: &str) -> Self {
    Self {
      inner,
      sealer: ChaCha20Poly1305::new(&derive_key(secret, "/uplink").into()),
      opener: ChaCha20Poly1305::new(&derive_key(secret, "/downlink").into()),
      seal_counter: 0,
      open_counter: 0,
      plaintext: Vec::new(),
      plaintext_offset: 0,
    }
  }

  /// The accepting side of the same protocol, with the direction keys
  /// swapped; used by in-process peers in tests.
  pub fn accepting(inner: S, secret: &str) -> Self {
    Self {
      inner,
      sealer: ChaCha20Poly1305::new(&derive_key(secret, "/downlink").into()),
      opener: ChaCha20Poly1305::new(&derive_key(secret, "/uplink").into()),
      seal_counter: 0,
      open_counter: 0,
      plaintext: Vec::new(),
      plaintext_offset: 0,
    }
  }

  fn buffered(&self) -> usize {
    self.plaintext.len() - self.plaintext_offset
  }
}

impl<S> CipherStream<S>
where
  S: AsyncRead + AsyncWrite + Send + Unpin,
{
  async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
    let nonce = counter_nonce(self.seal_counter);
    let ciphertext = self
      .sealer
      .encrypt(&nonce, chunk)
      .map_err(|_| aead_error())?;
    self.seal_counter += 1;
    let header = (ciphertext.len() as u16).to_be_bytes();
    self.inner.write_all(&header).await?;
    self.inner.write_all(&ciphertext).await?;
    Ok(())
  }

  /// Reads and opens one chunk into the plaintext buffer.
  /// Returns false on a clean end of stream at a chunk boundary.
  async fn fill_chunk(&mut self) -> std::io::Result<bool> {
    let mut header = [0u8; 2];
    // A clean EOF before the first header byte is a normal stream end;
    // EOF inside a chunk is a truncation error.
    let first = self.inner.read(&mut header[..1]).await?;
    if first == 0 {
      return Ok(false);
    }
    self.inner.read_exact(&mut header[1..]).await?;
    let length = u16::from_be_bytes(header) as usize;
    if length < TAG_SIZE {
      return Err(aead_error());
    }
    let mut ciphertext = vec![0u8; length];
    self.inner.read_exact(&mut ciphertext).await?;
    let nonce = counter_nonce(self.open_counter);
    let chunk = self
      .opener
      .decrypt(&nonce, ciphertext.as_slice())
      .map_err(|_| aead_error())?;
    self.open_counter += 1;
    self.plaintext = chunk;
    self.plaintext_offset = 0;
    Ok(true)
  }
}

impl<S> UpstreamConnection for CipherStream<S>
where
  S: AsyncRead + AsyncWrite + Send + Unpin,
{
  fn write_all<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, std::io::Result<()>> {
    async move {
      for chunk in data.chunks(MAX_CHUNK) {
        self.write_chunk(chunk).await?;
      }
      self.inner.flush().await
    }
    .boxed()
  }

  fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, std::io::Result<usize>> {
    async move {
      if self.buffered() == 0 && !self.fill_chunk().await? {
        return Ok(0);
      }
      let available = self.buffered();
      let taken = available.min(buf.len());
      buf[..taken]
        .copy_from_slice(&self.plaintext[self.plaintext_offset..self.plaintext_offset + taken]);
      self.plaintext_offset += taken;
      Ok(taken)
    }
    .boxed()
  }

  fn shutdown(&mut self) -> BoxFuture<'_, std::io::Result<()>> {
    self.inner.shutdown().boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::{CipherMethod, CipherStream, MAX_CHUNK};
  use crate::common::upstream::{UpstreamConnection, UpstreamError};

  #[test]
  fn method_names_parse() {
    assert_eq!(CipherMethod::from_name("").unwrap(), CipherMethod::None);
    assert_eq!(CipherMethod::from_name("none").unwrap(), CipherMethod::None);
    assert_eq!(
      CipherMethod::from_name("chacha20-ietf-poly1305").unwrap(),
      CipherMethod::ChaCha20IetfPoly1305
    );
    assert!(matches!(
      CipherMethod::from_name("aes-256-gcm"),
      Err(UpstreamError::UnsupportedCipher(name)) if name == "aes-256-gcm"
    ));
  }

  #[tokio::test]
  async fn enciphered_bytes_round_trip() {
    let (near, far) = tokio::io::duplex(1 << 20);
    let mut dialer = CipherStream::new(near, "s3cret");
    let mut acceptor = CipherStream::accepting(far, "s3cret");

    let payload = b"attack at dawn";
    dialer.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; 64];
    let n = acceptor.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], payload);

    // And back the other way, exercising the opposite direction key
    acceptor.write_all(b"ack").await.unwrap();
    let n = dialer.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ack");
  }

  #[tokio::test]
  async fn large_payloads_span_multiple_chunks() {
    let (near, far) = tokio::io::duplex(1 << 22);
    let mut dialer = CipherStream::new(near, "s3cret");
    let mut acceptor = CipherStream::accepting(far, "s3cret");

    let payload: Vec<u8> = (0..(MAX_CHUNK * 2 + 123)).map(|i| (i % 251) as u8).collect();
    dialer.write_all(&payload).await.unwrap();
    let mut received = Vec::new();
    let mut buf = vec![0u8; 4096];
    while received.len() < payload.len() {
      let n = acceptor.read(&mut buf).await.unwrap();
      assert!(n > 0);
      received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, payload);
  }

  #[tokio::test]
  async fn small_reads_drain_a_buffered_chunk() {
    let (near, far) = tokio::io::duplex(1 << 16);
    let mut dialer = CipherStream::new(near, "s3cret");
    let mut acceptor = CipherStream::accepting(far, "s3cret");

    dialer.write_all(b"abcdef").await.unwrap();
    let mut buf = [0u8; 2];
    let mut received = Vec::new();
    for _ in 0..3 {
      let n = acceptor.read(&mut buf).await.unwrap();
      received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, b"abcdef");
  }

  #[tokio::test]
  async fn wrong_secret_fails_verification() {
    let (near, far) = tokio::io::duplex(1 << 16);
    let mut dialer = CipherStream::new(near, "s3cret");
    let mut acceptor = CipherStream::accepting(far, "wrong");

    dialer.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 16];
    let err = acceptor.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
  }

  #[tokio::test]
  async fn clean_eof_at_chunk_boundary_reads_zero() {
    let (near, far) = tokio::io::duplex(1 << 16);
    let mut dialer = CipherStream::new(near, "s3cret");
    let mut acceptor = CipherStream::accepting(far, "s3cret");

    dialer.write_all(b"bye").await.unwrap();
    dialer.shutdown().await.unwrap();
    drop(dialer);
    let mut buf = [0u8; 16];
    let n = acceptor.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"bye");
    assert_eq!(acceptor.read(&mut buf).await.unwrap(), 0);
  }
}
