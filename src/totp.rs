use std::time::SystemTime;

use crate::{Otp, OtpCode, OtpError, OtpHashAlgorithm};

pub const DEFAULT_PERIOD: u64 = 30;
pub const DEFAULT_DIGITS: u32 = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct Totp {
    pub(crate) secret: String,
    pub(crate) algorithm: OtpHashAlgorithm,
    pub(crate) period: u64,
    pub(crate) digits: u32,
}

impl Otp for Totp {}

impl Totp {
    /// Creates the config for the [Time-based One-time Password Algorithm](http://en.wikipedia.org/wiki/Time-based_One-time_Password_Algorithm)
    /// (TOTP) given an RFC4648 base32 encoded secret.
    ///
    /// Obs.: This method defaults to the SHA1 hash, a 6-digit code and a period of 30 seconds
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            algorithm: OtpHashAlgorithm::SHA1,
            period: DEFAULT_PERIOD,
            digits: DEFAULT_DIGITS,
        }
    }

    ///  Sets hashing algorithm
    pub fn with_algorithm(&mut self, algorithm: OtpHashAlgorithm) -> &mut Self {
        self.algorithm = algorithm;

        self
    }

    ///  Sets the period in seconds
    pub fn with_period(&mut self, period: u64) -> &mut Self {
        self.period = period;

        self
    }

    ///  Sets the number of digits to generate
    pub fn with_digits(&mut self, digits: u32) -> &mut Self {
        self.digits = digits;

        self
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// The time step containing `seconds_since_epoch`.
    pub fn step(&self, seconds_since_epoch: u64) -> Result<u64, OtpError> {
        if self.period == 0 {
            return Err(OtpError::InvalidPeriod);
        }

        Ok(seconds_since_epoch / self.period)
    }

    /// Generates a Totp from the provided seconds since the UNIX epoch
    /// truncated to the specified number of digits
    pub fn generate(&self, seconds_since_epoch: u64) -> Result<OtpCode, OtpError> {
        self.generate_step(self.step(seconds_since_epoch)?)
    }

    fn generate_step(&self, step: u64) -> Result<OtpCode, OtpError> {
        let decoded = Self::decode_secret(self.secret.as_str())?;
        let digest = self.calc_digest(decoded.as_slice(), self.algorithm, step)?;

        let code = Self::encode_digest_truncated(digest.as_ref(), self.digits)?;

        Ok(OtpCode {
            code,
            digits: self.digits,
        })
    }

    /// Seconds left before the step containing `seconds_since_epoch` ends,
    /// always in `1..=period`.
    pub fn remaining_seconds(&self, seconds_since_epoch: u64) -> u64 {
        let period = self.period.max(1);

        period - seconds_since_epoch % period
    }

    /// Checks a code against the step containing `seconds_since_epoch` only.
    pub fn verify(&self, candidate: &str, seconds_since_epoch: u64) -> Result<bool, OtpError> {
        Ok(self.generate(seconds_since_epoch)?.matches(candidate))
    }

    /// Validates a code in the given window of steps around `seconds_since_epoch`,
    /// returning the step offset it matched at or None if the code is invalid.
    ///
    /// Obs.: the RFC recommends a window of 1 step in the future and 1 in the past,
    /// but this function accepts any window you would like
    pub fn verify_window(
        &self,
        candidate: &str,
        seconds_since_epoch: u64,
        past_steps: u64,
        future_steps: u64,
    ) -> Result<Option<i64>, OtpError> {
        let current = self.step(seconds_since_epoch)?;

        let mut offsets = vec![0i64];
        for i in 1..=past_steps {
            if i > current {
                break;
            }
            offsets.push(-(i as i64));
        }
        for i in 1..=future_steps {
            offsets.push(i as i64);
        }

        for offset in offsets {
            let step = current.saturating_add_signed(offset);
            if self.generate_step(step)?.matches(candidate) {
                return Ok(Some(offset));
            }
        }

        Ok(None)
    }
}

/// Current code for a base32 secret with the default SHA1, 6-digit, 30-second settings.
pub fn current_code(secret: &str, seconds_since_epoch: u64) -> Result<String, OtpError> {
    Ok(Totp::new(secret).generate(seconds_since_epoch)?.to_string())
}

/// Exact-step check of `candidate` with the default settings.
pub fn verify(secret: &str, candidate: &str, seconds_since_epoch: u64) -> Result<bool, OtpError> {
    Totp::new(secret).verify(candidate, seconds_since_epoch)
}

/// Seconds since the UNIX epoch according to the system clock.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
