//! Relay server certificates.
//!
//! The relay proves its static key during the handshake and additionally
//! presents a certificate binding that key to an issuer. The certificate is
//! signed by a root key the client trusts out of band.
//!
//! Wire layout:
//!
//! ```text
//! serial (u32 BE) | issuer_len (u8) | issuer | key (32) | not_after (u64 BE) | signature (64)
//! ```

use crate::CryptoError;
use crate::signatures::{Signature, SigningKey, VerifyingKey};
use crate::x25519::PublicKey;

const FIXED_LEN: usize = 4 + 1 + 32 + 8 + 64;

/// A relay certificate binding a static key to an issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCertificate {
    /// Certificate serial number
    pub serial: u32,
    /// Issuer name
    pub issuer: String,
    /// Static transport key of the relay
    pub key: PublicKey,
    /// Expiry, seconds since the Unix epoch
    pub not_after: u64,
    /// Root signature over the details
    pub signature: Signature,
}

impl ServerCertificate {
    /// Issue a certificate signed by `root`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCertificate`] if the issuer name is longer than 255 bytes.
    pub fn issue(
        root: &SigningKey,
        serial: u32,
        issuer: &str,
        key: PublicKey,
        not_after: u64,
    ) -> Result<Self, CryptoError> {
        let details = encode_details(serial, issuer, &key, not_after)?;
        Ok(Self {
            serial,
            issuer: issuer.to_string(),
            key,
            not_after,
            signature: root.sign(&details),
        })
    }

    /// Serialize to the wire layout.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCertificate`] if the issuer name is longer than 255 bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CryptoError> {
        let mut out = encode_details(self.serial, &self.issuer, &self.key, self.not_after)?;
        out.extend_from_slice(self.signature.as_bytes());
        Ok(out)
    }

    /// Parse the wire layout.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCertificate`] on truncated or trailing data.
    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        let malformed = || CryptoError::InvalidCertificate("malformed encoding".into());

        if bytes.len() < FIXED_LEN {
            return Err(malformed());
        }
        let serial = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let issuer_len = bytes[4] as usize;
        if bytes.len() != FIXED_LEN + issuer_len {
            return Err(malformed());
        }

        let mut pos = 5;
        let issuer = std::str::from_utf8(&bytes[pos..pos + issuer_len])
            .map_err(|_| malformed())?
            .to_string();
        pos += issuer_len;

        let key = PublicKey::from_slice(&bytes[pos..pos + 32]).ok_or_else(malformed)?;
        pos += 32;

        let mut not_after = [0u8; 8];
        not_after.copy_from_slice(&bytes[pos..pos + 8]);
        pos += 8;

        let signature = Signature::from_slice(&bytes[pos..])?;

        Ok(Self {
            serial,
            issuer,
            key,
            not_after: u64::from_be_bytes(not_after),
            signature,
        })
    }

    /// Validate the certificate against the trusted root and the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCertificate`] when the signature does not
    /// verify, the issuer differs from `expected_issuer`, the certified key is
    /// not the static key proven in the handshake, or the certificate expired.
    pub fn validate(
        &self,
        root: &VerifyingKey,
        expected_issuer: &str,
        server_static: &PublicKey,
        now: u64,
    ) -> Result<(), CryptoError> {
        let details = encode_details(self.serial, &self.issuer, &self.key, self.not_after)?;
        root.verify(&details, &self.signature)
            .map_err(|_| CryptoError::InvalidCertificate("bad root signature".into()))?;

        if self.issuer != expected_issuer {
            return Err(CryptoError::InvalidCertificate(format!(
                "unexpected issuer {}",
                self.issuer
            )));
        }
        if self.key != *server_static {
            return Err(CryptoError::InvalidCertificate(
                "certified key does not match server static key".into(),
            ));
        }
        if now > self.not_after {
            return Err(CryptoError::InvalidCertificate("expired".into()));
        }
        Ok(())
    }
}

fn encode_details(
    serial: u32,
    issuer: &str,
    key: &PublicKey,
    not_after: u64,
) -> Result<Vec<u8>, CryptoError> {
    let issuer_len = u8::try_from(issuer.len())
        .map_err(|_| CryptoError::InvalidCertificate("issuer too long".into()))?;

    let mut out = Vec::with_capacity(FIXED_LEN + issuer.len());
    out.extend_from_slice(&serial.to_be_bytes());
    out.push(issuer_len);
    out.extend_from_slice(issuer.as_bytes());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(&not_after.to_be_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x25519::KeyPair;
    use rand_core::OsRng;

    fn fixture() -> (SigningKey, KeyPair, ServerCertificate) {
        let root = SigningKey::generate(&mut OsRng);
        let server = KeyPair::generate();
        let cert = ServerCertificate::issue(&root, 7, "relay.test", server.public, 2_000).unwrap();
        (root, server, cert)
    }

    #[test]
    fn test_encode_decode() {
        let (_, _, cert) = fixture();
        let decoded = ServerCertificate::decode(&cert.encode().unwrap()).unwrap();
        assert_eq!(decoded, cert);
    }

    #[test]
    fn test_validate_accepts_matching_certificate() {
        let (root, server, cert) = fixture();
        assert!(
            cert.validate(&root.verifying_key(), "relay.test", &server.public, 1_000)
                .is_ok()
        );
    }

    #[test]
    fn test_validate_rejects_wrong_root() {
        let (_, server, cert) = fixture();
        let other = SigningKey::generate(&mut OsRng);
        assert!(
            cert.validate(&other.verifying_key(), "relay.test", &server.public, 1_000)
                .is_err()
        );
    }

    #[test]
    fn test_validate_rejects_key_mismatch_issuer_and_expiry() {
        let (root, server, cert) = fixture();
        let root_pub = root.verifying_key();
        let stranger = KeyPair::generate();

        assert!(cert.validate(&root_pub, "relay.test", &stranger.public, 1_000).is_err());
        assert!(cert.validate(&root_pub, "other.test", &server.public, 1_000).is_err());
        assert!(cert.validate(&root_pub, "relay.test", &server.public, 2_001).is_err());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let (_, _, cert) = fixture();
        let bytes = cert.encode().unwrap();
        for len in 0..bytes.len() {
            assert!(ServerCertificate::decode(&bytes[..len]).is_err());
        }
    }
}
