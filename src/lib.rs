pub mod api;
pub mod config;
pub mod qr;
pub mod scheduler;
pub mod store;
pub mod totp;
pub mod uri;

use std::{fmt::Display, str::FromStr};

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

#[derive(Debug, thiserror::Error)]
pub enum OtpError {
    #[error("Secret decode error: {0}")]
    SecretDecode(data_encoding::DecodeError),
    #[error("Invalid digest")]
    InvalidDigest(Vec<u8>),
    #[error("The HMAC key could not be constructed")]
    InvalidKey,
    #[error("Invalid hashing algorithm, found {0}. Expected one of: SHA1, SHA256 or SHA512")]
    InvalidHashingAlgorithm(String),
    #[error("Invalid digit count, found {0}. Expected a value between 1 and 9")]
    InvalidDigits(u32),
    #[error("The period must be greater than zero")]
    InvalidPeriod,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum OtpHashAlgorithm {
    #[default]
    SHA1,
    SHA256,
    SHA512,
}

impl Display for OtpHashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SHA1 => write!(f, "SHA1"),
            Self::SHA256 => write!(f, "SHA256"),
            Self::SHA512 => write!(f, "SHA512"),
        }
    }
}

impl FromStr for OtpHashAlgorithm {
    type Err = OtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_uppercase();

        match normalized.as_str() {
            "SHA1" => Ok(Self::SHA1),
            "SHA256" => Ok(Self::SHA256),
            "SHA512" => Ok(Self::SHA512),
            _ => Err(OtpError::InvalidHashingAlgorithm(s.to_string())),
        }
    }
}

/// A generated code, together with the digit count it must be padded to.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct OtpCode {
    code: u32,
    digits: u32,
}

impl OtpCode {
    pub fn integer(&self) -> u32 {
        self.code
    }

    /// Compares a user-supplied code against this one.
    ///
    /// Surrounding whitespace is ignored, but leading zeros are significant:
    /// `"012345"` matches while `"12345"` does not.
    pub fn matches(&self, candidate: &str) -> bool {
        candidate.trim() == self.to_string()
    }
}

impl Display for OtpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:0padding$}",
            self.code,
            padding = (self.digits as usize)
        )
    }
}

/// Canonical form of a user-entered secret: whitespace and `=` padding
/// removed, letters uppercased.
pub fn normalize_secret(secret: &str) -> String {
    secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

pub trait Otp {
    /// Decodes a secret (given as an RFC4648 base32-encoded ASCII string)
    /// into a byte string
    fn decode_secret(secret: &str) -> Result<Vec<u8>, OtpError> {
        data_encoding::BASE32_NOPAD
            .decode(normalize_secret(secret).as_bytes())
            .map_err(OtpError::SecretDecode)
    }

    /// Calculates the HMAC digest of `data` (big-endian) keyed by the decoded secret.
    fn calc_digest(
        &self,
        decoded_secret: &[u8],
        algorithm: OtpHashAlgorithm,
        data: u64,
    ) -> Result<Vec<u8>, OtpError> {
        let data = data.to_be_bytes();

        let digest = match algorithm {
            OtpHashAlgorithm::SHA1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(decoded_secret)
                    .map_err(|_| OtpError::InvalidKey)?;
                mac.update(&data);
                mac.finalize().into_bytes().to_vec()
            }
            OtpHashAlgorithm::SHA256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(decoded_secret)
                    .map_err(|_| OtpError::InvalidKey)?;
                mac.update(&data);
                mac.finalize().into_bytes().to_vec()
            }
            OtpHashAlgorithm::SHA512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(decoded_secret)
                    .map_err(|_| OtpError::InvalidKey)?;
                mac.update(&data);
                mac.finalize().into_bytes().to_vec()
            }
        };

        Ok(digest)
    }

    /// Encodes the HMAC digest into a truncated integer.
    fn encode_digest_truncated(digest: &[u8], target_digits_count: u32) -> Result<u32, OtpError> {
        if !(1..=9).contains(&target_digits_count) {
            return Err(OtpError::InvalidDigits(target_digits_count));
        }

        // While sometimes this is a hardcoded 19
        // the last byte tells us the offset for any algorithm
        let offset = match digest.last() {
            Some(x) => *x & 0xf,
            None => return Err(OtpError::InvalidDigest(Vec::from(digest))),
        } as usize;

        // Gets the 4 bytes that will compose the code
        let code_bytes: [u8; 4] = match digest
            .get(offset..offset + 4)
            .and_then(|bytes| bytes.try_into().ok())
        {
            Some(x) => x,
            None => return Err(OtpError::InvalidDigest(Vec::from(digest))),
        };

        let code = u32::from_be_bytes(code_bytes);
        let truncation_factor = u32::pow(10, target_digits_count);

        Ok((code & 0x7fffffff) % truncation_factor)
    }
}
