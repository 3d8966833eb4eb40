//! Framed, optionally sealed halves of the relay stream.
//!
//! The stream is split once: the read loop owns a [`FrameReader`] with the
//! receive half of the frame cipher, the write path owns a [`FrameWriter`]
//! with the send half. Neither half waits on the other.

use crate::error::{Error, Result, TransportError};
use crate::frame::{FrameDecoder, INTRO_HEADER, encode_frame};
use courier_crypto::CryptoError;
use courier_crypto::frame_cipher::{FrameOpener, FrameSealer};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 16 * 1024;

/// Reading half: splits the stream into frames and opens them once the
/// handshake installed a cipher.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    opener: Option<FrameOpener>,
    queued: VecDeque<Vec<u8>>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a stream half.
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_frame_size),
            opener: None,
            queued: VecDeque::new(),
            buf: vec![0u8; READ_CHUNK],
        }
    }

    /// Consume and check the client's intro header (relay side).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BadIntro`] if the header differs.
    pub async fn read_intro(&mut self) -> Result<()> {
        let mut header = [0u8; INTRO_HEADER.len()];
        self.inner
            .read_exact(&mut header)
            .await
            .map_err(TransportError::from)?;
        if header != INTRO_HEADER {
            return Err(TransportError::BadIntro.into());
        }
        Ok(())
    }

    /// Open every following frame with `opener`.
    pub fn install_opener(&mut self, opener: FrameOpener) {
        self.opener = Some(opener);
    }

    /// Whether frames are being opened.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.opener.is_some()
    }

    /// Next single frame.
    ///
    /// # Errors
    ///
    /// See [`FrameReader::next_batch`].
    pub async fn next_frame(&mut self) -> Result<Vec<u8>> {
        if self.queued.is_empty() {
            self.fill().await?;
        }
        match self.queued.pop_front() {
            Some(raw) => self.open(raw),
            None => Err(TransportError::Eof.into()),
        }
    }

    /// Every frame completed by the next network read, in order.
    ///
    /// Frames already buffered are returned without reading.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Eof`] when the peer closed between frames
    /// - [`TransportError::UnexpectedEof`] when it closed mid-frame
    /// - [`TransportError::FrameTooLarge`] for oversized frames
    /// - [`Error::FrameOrder`] for a counter other than the next expected one
    /// - [`TransportError::AuthenticationFailed`] for a frame that fails to open
    pub async fn next_batch(&mut self) -> Result<Vec<Vec<u8>>> {
        if self.queued.is_empty() {
            self.fill().await?;
        }
        let raw: Vec<Vec<u8>> = self.queued.drain(..).collect();
        raw.into_iter().map(|frame| self.open(frame)).collect()
    }

    async fn fill(&mut self) -> Result<()> {
        loop {
            let n = self
                .inner
                .read(&mut self.buf)
                .await
                .map_err(TransportError::from)?;
            if n == 0 {
                let buffered = self.decoder.buffered();
                return Err(if buffered > 0 {
                    TransportError::UnexpectedEof(buffered)
                } else {
                    TransportError::Eof
                }
                .into());
            }

            let frames = self.decoder.push(&self.buf[..n])?;
            if !frames.is_empty() {
                tracing::trace!("read {} bytes, {} frames", n, frames.len());
                self.queued.extend(frames);
                return Ok(());
            }
        }
    }

    fn open(&mut self, raw: Vec<u8>) -> Result<Vec<u8>> {
        let Some(opener) = self.opener.as_mut() else {
            return Ok(raw);
        };
        opener.open(&raw).map_err(|e| match e {
            CryptoError::FrameOrder { expected, received } => {
                tracing::warn!(
                    "frame order violation: expected {}, received {}",
                    expected,
                    received
                );
                Error::FrameOrder { expected, received }
            }
            _ => TransportError::AuthenticationFailed.into(),
        })
    }
}

/// Writing half: length-prefixes frames and seals them once the handshake
/// installed a cipher.
pub struct FrameWriter<W> {
    inner: W,
    sealer: Option<FrameSealer>,
    max_frame_size: usize,
    intro: Option<[u8; INTRO_HEADER.len()]>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a stream half.
    pub fn new(inner: W, max_frame_size: usize) -> Self {
        Self {
            inner,
            sealer: None,
            max_frame_size,
            intro: None,
        }
    }

    /// Send the intro header in front of the first frame (client side).
    #[must_use]
    pub fn with_intro(mut self) -> Self {
        self.intro = Some(INTRO_HEADER);
        self
    }

    /// Seal every following frame with `sealer`.
    pub fn install_sealer(&mut self, sealer: FrameSealer) {
        self.sealer = Some(sealer);
    }

    /// Whether frames are being sealed.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.sealer.is_some()
    }

    /// Counter of the next sealed frame.
    #[must_use]
    pub fn counter(&self) -> Option<u64> {
        self.sealer.as_ref().map(FrameSealer::counter)
    }

    /// Seal (if a cipher is installed), frame and flush `body`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::FrameTooLarge`] for oversized bodies, a
    /// crypto error if the counter is exhausted, or an I/O failure.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<()> {
        let frame = match self.sealer.as_mut() {
            Some(sealer) => encode_frame(&sealer.seal(body)?, self.max_frame_size)?,
            None => encode_frame(body, self.max_frame_size)?,
        };

        if let Some(intro) = self.intro.take() {
            self.inner
                .write_all(&intro)
                .await
                .map_err(TransportError::from)?;
        }
        self.inner
            .write_all(&frame)
            .await
            .map_err(TransportError::from)?;
        self.inner.flush().await.map_err(TransportError::from)?;
        Ok(())
    }

    /// Shut the write side down.
    ///
    /// # Errors
    ///
    /// Returns the I/O failure, if any.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await.map_err(TransportError::from)?;
        Ok(())
    }
}
