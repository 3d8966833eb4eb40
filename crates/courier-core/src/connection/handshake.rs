//! Client side of the relay handshake over a framed stream.
//!
//! ```text
//! -> intro, e
//! <- e, ee, s, es, certificate
//! -> s, se, login payload
//! ```
//!
//! The certificate must be signed by the configured root, name the
//! configured issuer, certify exactly the static key the relay proved in
//! the handshake, and not be expired.

use crate::error::{Error, Result};
use crate::frame::INTRO_HEADER;
use crate::transport::{FrameReader, FrameWriter};
use courier_crypto::certificate::ServerCertificate;
use courier_crypto::handshake::Handshake;
use courier_crypto::signatures::VerifyingKey;
use courier_crypto::x25519::{KeyPair, PublicKey};
use std::borrow::Cow;
use tokio::io::{AsyncRead, AsyncWrite};

/// Stream halves with the frame cipher installed.
pub struct SecureChannel<R, W> {
    /// Reading half
    pub reader: FrameReader<R>,
    /// Writing half
    pub writer: FrameWriter<W>,
    /// Relay static key proven during the handshake
    pub server_static: PublicKey,
    /// Final transcript hash
    pub handshake_hash: [u8; 32],
}

/// Relay trust anchor.
#[derive(Debug, Clone, Copy)]
pub struct CertificateTrust<'a> {
    /// Root key signing relay certificates
    pub root: &'a VerifyingKey,
    /// Issuer the certificate must name
    pub issuer: &'a str,
}

/// Run the initiator side of the handshake.
///
/// `writer` must have been created with [`FrameWriter::with_intro`] so the
/// prologue precedes the first frame.
///
/// # Errors
///
/// Returns [`Error::HandshakeFailure`] on any transcript, AEAD, DH or
/// certificate failure, and transport errors as they occur.
pub async fn client_handshake<R, W>(
    mut reader: FrameReader<R>,
    mut writer: FrameWriter<W>,
    noise_key: &KeyPair,
    login_payload: &[u8],
    trust: CertificateTrust<'_>,
    now: u64,
) -> Result<SecureChannel<R, W>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut handshake = Handshake::initiator(noise_key, &INTRO_HEADER)?;

    let hello = handshake.write_message(&[])?;
    writer.write_frame(&hello).await?;
    tracing::debug!("handshake: sent ephemeral ({} bytes)", hello.len());

    let reply = reader.next_frame().await?;
    let certificate_bytes = handshake.read_message(&reply)?;
    let server_static = handshake
        .remote_static()
        .ok_or(Error::HandshakeFailure(Cow::Borrowed("relay static key missing")))?;

    let certificate = ServerCertificate::decode(&certificate_bytes)?;
    certificate.validate(trust.root, trust.issuer, &server_static, now)?;
    tracing::debug!(
        "handshake: certificate serial {} from {} accepted",
        certificate.serial,
        certificate.issuer
    );

    let finish = handshake.write_message(login_payload)?;
    writer.write_frame(&finish).await?;

    let keys = handshake.into_transport()?;
    let handshake_hash = keys.handshake_hash;
    let (sealer, opener) = keys.into_ciphers();
    writer.install_sealer(sealer);
    reader.install_opener(opener);
    tracing::debug!("handshake: complete, transport keys installed");

    Ok(SecureChannel {
        reader,
        writer,
        server_static,
        handshake_hash,
    })
}
