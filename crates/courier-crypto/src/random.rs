//! OS randomness for long-lived identifiers and secrets.

use crate::CryptoError;

/// `N` bytes from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the OS source is unavailable.
pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    getrandom::getrandom(&mut out).map_err(|_| CryptoError::RandomFailed)?;
    Ok(out)
}

/// Fresh 32-byte secret.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the OS source is unavailable.
pub fn random_32() -> Result<[u8; 32], CryptoError> {
    random_array()
}

/// Random `u32`, used for registration and sender key ids.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the OS source is unavailable.
pub fn random_u32() -> Result<u32, CryptoError> {
    random_array().map(u32::from_be_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_differ() {
        assert_ne!(random_32().unwrap(), random_32().unwrap());
    }

    #[test]
    fn test_zero_length() {
        assert_eq!(random_array::<0>().unwrap(), [0u8; 0]);
    }
}
