//! Streaming AES-256-CBC payload cipher.
//!
//! [`StreamCipher`] wraps any [`AsyncRead`] in an encrypting or decrypting
//! reader that holds at most two cipher blocks of state, so payloads of any
//! size pass through in constant memory.
//!
//! # Format
//!
//! - Key: SHA-256 of the caller's secret string.
//! - Chaining: CBC, starting from the caller's IV or an all-zero block.
//! - Padding: PKCS#7, applied according to [`Padding`].
//!
//! [`Padding::PerChunk`] pads every chunk the encryptor pulls from upstream.
//! The encryptor fills a whole block before padding, so a full chunk comes
//! out as its data block followed by a complete padding block, and only the
//! final short chunk is padded in place. The decryptor consumes up to two
//! blocks per step and strips the padding of each step. This is the format
//! existing vaults were written in.
//!
//! [`Padding::Final`] is textbook CBC: only the last block carries padding.
//!
//! There is no authentication tag. A wrong key or corrupted ciphertext is
//! detected only when the padding fails to verify, and may otherwise decrypt
//! to garbage.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, ReadBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CipherError;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Where PKCS#7 padding is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Padding {
    /// Pad every chunk. Compatible with vaults written by earlier clients.
    #[default]
    PerChunk,
    /// Pad only the final block.
    Final,
}

impl std::str::FromStr for Padding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chunk" | "per-chunk" => Ok(Self::PerChunk),
            "final" => Ok(Self::Final),
            other => Err(format!("unknown padding mode '{other}' (expected chunk or final)")),
        }
    }
}

/// A 256-bit key derived from the caller's secret. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct CipherKey([u8; 32]);

impl CipherKey {
    fn derive(secret: &str) -> Self {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&Sha256::digest(secret.as_bytes()));
        Self(bytes)
    }

    fn block_cipher(&self) -> Aes256 {
        Aes256::new(aes::cipher::generic_array::GenericArray::from_slice(&self.0))
    }
}

/// Factory for encrypting and decrypting readers sharing one key.
///
/// # Examples
///
/// ```
/// # use keeper_core::cipher::StreamCipher;
/// # use tokio::io::AsyncReadExt;
/// # #[tokio::main]
/// # async fn main() -> std::io::Result<()> {
/// let cipher = StreamCipher::new("correct horse battery staple");
///
/// let mut sealed = Vec::new();
/// cipher.encrypt_reader(&b"s3cr3t"[..]).read_to_end(&mut sealed).await?;
///
/// let mut opened = Vec::new();
/// cipher.decrypt_reader(sealed.as_slice()).read_to_end(&mut opened).await?;
/// assert_eq!(opened, b"s3cr3t");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StreamCipher {
    key: CipherKey,
    iv: [u8; BLOCK_SIZE],
    padding: Padding,
}

impl StreamCipher {
    /// Derive the key from `secret`. IV is all zeros, padding is
    /// [`Padding::PerChunk`].
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            key: CipherKey::derive(secret),
            iv: [0u8; BLOCK_SIZE],
            padding: Padding::default(),
        }
    }

    #[must_use]
    pub fn with_iv(mut self, iv: [u8; BLOCK_SIZE]) -> Self {
        self.iv = iv;
        self
    }

    #[must_use]
    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    #[must_use]
    pub fn padding(&self) -> Padding {
        self.padding
    }

    /// Wrap `inner` so that reading yields its ciphertext.
    pub fn encrypt_reader<R: AsyncRead + Unpin>(&self, inner: R) -> EncryptReader<R> {
        EncryptReader {
            inner,
            cipher: self.key.block_cipher(),
            chain: self.iv,
            padding: self.padding,
            pending: [0u8; BLOCK_SIZE],
            filled: 0,
            out: [0u8; 2 * BLOCK_SIZE],
            out_pos: 0,
            out_len: 0,
            eof: false,
            done: false,
        }
    }

    /// Wrap `inner` so that reading yields its plaintext.
    ///
    /// Malformed padding surfaces as an `io::Error` of kind `InvalidData`
    /// wrapping a [`CipherError`].
    pub fn decrypt_reader<R: AsyncRead + Unpin>(&self, inner: R) -> DecryptReader<R> {
        DecryptReader {
            inner,
            cipher: self.key.block_cipher(),
            chain: self.iv,
            padding: self.padding,
            raw: [0u8; 2 * BLOCK_SIZE],
            filled: 0,
            out: [0u8; 2 * BLOCK_SIZE],
            out_pos: 0,
            out_len: 0,
            held: None,
            eof: false,
            done: false,
            failed: false,
        }
    }
}

impl fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCipher")
            .field("key", &"[REDACTED]")
            .field("padding", &self.padding)
            .finish_non_exhaustive()
    }
}

fn encrypt_block(cipher: &Aes256, chain: &mut [u8; BLOCK_SIZE], plain: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut block = Block::clone_from_slice(plain);
    for (b, c) in block.iter_mut().zip(chain.iter()) {
        *b ^= c;
    }
    cipher.encrypt_block(&mut block);
    chain.copy_from_slice(&block);
    *chain
}

fn decrypt_block(cipher: &Aes256, chain: &mut [u8; BLOCK_SIZE], raw: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut block = Block::clone_from_slice(raw);
    cipher.decrypt_block(&mut block);
    let mut plain = [0u8; BLOCK_SIZE];
    for ((p, b), c) in plain.iter_mut().zip(block.iter()).zip(chain.iter()) {
        *p = b ^ c;
    }
    chain.copy_from_slice(raw);
    plain
}

/// Strip PKCS#7 padding from `data`, returning the unpadded length.
fn unpad(data: &[u8]) -> Result<usize, CipherError> {
    let invalid = |reason: &str| CipherError::Padding {
        reason: reason.to_owned(),
    };
    let Some(&last) = data.last() else {
        return Err(invalid("empty block"));
    };
    let n = usize::from(last);
    if n == 0 || n > BLOCK_SIZE || n > data.len() {
        return Err(invalid("pad length out of range"));
    }
    let (body, pad) = data.split_at(data.len() - n);
    if pad.iter().any(|&b| b != last) {
        return Err(invalid("pad bytes disagree"));
    }
    Ok(body.len())
}

/// Pull from `inner` into `buf[*filled..]` until `buf` is full or upstream
/// reports end of stream.
fn poll_fill<R: AsyncRead + Unpin>(
    inner: &mut R,
    cx: &mut Context<'_>,
    buf: &mut [u8],
    filled: &mut usize,
    eof: &mut bool,
) -> Poll<io::Result<()>> {
    while !*eof && *filled < buf.len() {
        let mut rb = ReadBuf::new(&mut buf[*filled..]);
        ready!(Pin::new(&mut *inner).poll_read(cx, &mut rb))?;
        match rb.filled().len() {
            0 => *eof = true,
            n => *filled += n,
        }
    }
    Poll::Ready(Ok(()))
}

/// Copy buffered output into `buf`. Returns `true` if anything was copied.
fn drain(out: &[u8], pos: &mut usize, len: usize, buf: &mut ReadBuf<'_>) -> bool {
    if *pos >= len {
        return false;
    }
    let n = (len - *pos).min(buf.remaining());
    buf.put_slice(&out[*pos..*pos + n]);
    *pos += n;
    true
}

/// Encrypting reader returned by [`StreamCipher::encrypt_reader`].
pub struct EncryptReader<R> {
    inner: R,
    cipher: Aes256,
    chain: [u8; BLOCK_SIZE],
    padding: Padding,
    pending: [u8; BLOCK_SIZE],
    filled: usize,
    out: [u8; 2 * BLOCK_SIZE],
    out_pos: usize,
    out_len: usize,
    eof: bool,
    done: bool,
}

impl<R> EncryptReader<R> {
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Unwrap the upstream reader. Buffered ciphertext is discarded.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn emit_padded(&mut self, len: usize) {
        let mut padded = [0u8; 2 * BLOCK_SIZE];
        padded[..len].copy_from_slice(&self.pending[..len]);
        let total = (len / BLOCK_SIZE + 1) * BLOCK_SIZE;
        #[allow(clippy::cast_possible_truncation)]
        padded[len..total].fill((total - len) as u8);
        for (i, chunk) in padded[..total].chunks_exact(BLOCK_SIZE).enumerate() {
            let c = encrypt_block(&self.cipher, &mut self.chain, chunk);
            self.out[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE].copy_from_slice(&c);
        }
        padded.zeroize();
        self.out_pos = 0;
        self.out_len = total;
    }

    fn produce(&mut self) {
        let len = self.filled;
        self.filled = 0;
        match self.padding {
            Padding::PerChunk if len == 0 => self.done = true,
            Padding::PerChunk => self.emit_padded(len),
            Padding::Final if len == BLOCK_SIZE => {
                let c = encrypt_block(&self.cipher, &mut self.chain, &self.pending);
                self.out[..BLOCK_SIZE].copy_from_slice(&c);
                self.out_pos = 0;
                self.out_len = BLOCK_SIZE;
            }
            Padding::Final => {
                self.emit_padded(len);
                self.done = true;
            }
        }
        self.pending.zeroize();
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for EncryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if drain(&this.out, &mut this.out_pos, this.out_len, buf) {
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }
            ready!(poll_fill(
                &mut this.inner,
                cx,
                &mut this.pending,
                &mut this.filled,
                &mut this.eof,
            ))?;
            this.produce();
        }
    }
}

/// Decrypting reader returned by [`StreamCipher::decrypt_reader`].
pub struct DecryptReader<R> {
    inner: R,
    cipher: Aes256,
    chain: [u8; BLOCK_SIZE],
    padding: Padding,
    raw: [u8; 2 * BLOCK_SIZE],
    filled: usize,
    out: [u8; 2 * BLOCK_SIZE],
    out_pos: usize,
    out_len: usize,
    /// Last decrypted block in [`Padding::Final`] mode, unpadded at EOF.
    held: Option<[u8; BLOCK_SIZE]>,
    eof: bool,
    done: bool,
    failed: bool,
}

impl<R> DecryptReader<R> {
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Unwrap the upstream reader. Buffered plaintext is discarded.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn step_len(&self) -> usize {
        match self.padding {
            Padding::PerChunk => 2 * BLOCK_SIZE,
            Padding::Final => BLOCK_SIZE,
        }
    }

    fn produce(&mut self) -> Result<(), CipherError> {
        let len = self.filled;
        self.filled = 0;
        self.out_pos = 0;
        self.out_len = 0;

        if len % BLOCK_SIZE != 0 {
            return Err(CipherError::Padding {
                reason: format!("truncated ciphertext: {len} trailing bytes"),
            });
        }

        match self.padding {
            Padding::PerChunk => {
                if len == 0 {
                    self.done = true;
                    return Ok(());
                }
                for i in 0..len / BLOCK_SIZE {
                    let range = i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE;
                    let p = decrypt_block(&self.cipher, &mut self.chain, &self.raw[range.clone()]);
                    self.out[range].copy_from_slice(&p);
                }
                self.out_len = unpad(&self.out[..len])?;
            }
            Padding::Final => {
                if len == 0 {
                    let Some(last) = self.held.take() else {
                        return Err(CipherError::Padding {
                            reason: "empty ciphertext".to_owned(),
                        });
                    };
                    self.out[..BLOCK_SIZE].copy_from_slice(&last);
                    self.out_len = unpad(&last)?;
                    self.done = true;
                    return Ok(());
                }
                let p = decrypt_block(&self.cipher, &mut self.chain, &self.raw[..BLOCK_SIZE]);
                if let Some(prev) = self.held.replace(p) {
                    self.out[..BLOCK_SIZE].copy_from_slice(&prev);
                    self.out_len = BLOCK_SIZE;
                }
            }
        }
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if this.failed {
                return Poll::Ready(Err(CipherError::Padding {
                    reason: "stream already failed".to_owned(),
                }
                .into_io()));
            }
            if drain(&this.out, &mut this.out_pos, this.out_len, buf) {
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }
            let step = this.step_len();
            ready!(poll_fill(
                &mut this.inner,
                cx,
                &mut this.raw[..step],
                &mut this.filled,
                &mut this.eof,
            ))?;
            if let Err(e) = this.produce() {
                this.failed = true;
                this.out.zeroize();
                return Poll::Ready(Err(e.into_io()));
            }
        }
    }
}
