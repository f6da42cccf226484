//! `otpauth://totp/` URIs, the payload carried by enrolment QR codes.

use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::{
    totp::{Totp, DEFAULT_DIGITS, DEFAULT_PERIOD},
    OtpHashAlgorithm,
};

const OTPAUTH_SCHEME: &str = "otpauth";
const TOTP_TYPE: &str = "totp";

const URI_SECRET_QUERY: &str = "secret";
const URI_ISSUER_QUERY: &str = "issuer";
const URI_HASH_QUERY: &str = "algorithm";
const URI_PERIOD_QUERY: &str = "period";
const URI_DIGITS_QUERY: &str = "digits";

// Characters left readable in the label; everything else is percent-encoded.
const LABEL_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b':')
    .remove(b'@');

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UriError {
    #[error("The payload is not an otpauth URI")]
    NotOtpAuth,
    #[error("Unsupported OTP type, found {0}. Expected: totp")]
    UnsupportedOtpType(String),
    #[error("Could not retrieve the secret from the URI")]
    MissingSecret,
    #[error("Invalid value for the {0} parameter: {1}")]
    InvalidParameter(&'static str, String),
}

/// The contents of an `otpauth://totp/` URI.
#[derive(Debug, Clone, PartialEq)]
pub struct OtpAuthUri {
    pub label: String,
    pub secret: String,
    pub issuer: Option<String>,
    pub algorithm: OtpHashAlgorithm,
    pub digits: u32,
    pub period: u64,
}

impl OtpAuthUri {
    pub fn new(label: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            secret: secret.into(),
            issuer: None,
            algorithm: OtpHashAlgorithm::default(),
            digits: DEFAULT_DIGITS,
            period: DEFAULT_PERIOD,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();
        self.issuer = (!issuer.is_empty()).then_some(issuer);

        self
    }

    pub fn to_totp(&self) -> Totp {
        let mut totp = Totp::new(self.secret.clone());
        totp.with_algorithm(self.algorithm)
            .with_digits(self.digits)
            .with_period(self.period);

        totp
    }
}

/// Renders `otpauth://totp/<label>?secret=<secret>`.
///
/// Parameters equal to the defaults (SHA1, 6 digits, 30 seconds) are left out.
pub fn build_uri(entry: &OtpAuthUri) -> String {
    let label = utf8_percent_encode(&entry.label, LABEL_ENCODE_SET);

    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair(URI_SECRET_QUERY, &entry.secret);

    if let Some(issuer) = entry.issuer.as_deref().filter(|i| !i.is_empty()) {
        query.append_pair(URI_ISSUER_QUERY, issuer);
    }
    if entry.algorithm != OtpHashAlgorithm::default() {
        query.append_pair(URI_HASH_QUERY, &entry.algorithm.to_string());
    }
    if entry.digits != DEFAULT_DIGITS {
        query.append_pair(URI_DIGITS_QUERY, &entry.digits.to_string());
    }
    if entry.period != DEFAULT_PERIOD {
        query.append_pair(URI_PERIOD_QUERY, &entry.period.to_string());
    }

    format!("{OTPAUTH_SCHEME}://{TOTP_TYPE}/{label}?{}", query.finish())
}

/// Parses a decoded QR payload.
///
/// The label is the percent-decoded text between `/totp/` and the query, read
/// from the raw payload so that dot segments survive. It is empty when the
/// path is missing.
pub fn parse_uri(text: &str) -> Result<OtpAuthUri, UriError> {
    let uri = url::Url::parse(text.trim()).map_err(|_| UriError::NotOtpAuth)?;

    if uri.scheme() != OTPAUTH_SCHEME {
        return Err(UriError::NotOtpAuth);
    }

    match uri.host_str() {
        Some(host) if host.eq_ignore_ascii_case(TOTP_TYPE) => {}
        other => return Err(UriError::UnsupportedOtpType(other.unwrap_or("None").into())),
    }

    let label = percent_decode_str(raw_label(text.trim()))
        .decode_utf8_lossy()
        .into_owned();

    let mut entry = OtpAuthUri::new(label, "");

    for params in uri.query_pairs() {
        let value = params.1.trim();
        match params.0.as_ref() {
            URI_SECRET_QUERY => entry.secret = value.to_string(),
            URI_ISSUER_QUERY => {
                entry.issuer = (!value.is_empty()).then(|| value.to_string())
            }
            URI_HASH_QUERY => {
                entry.algorithm = OtpHashAlgorithm::from_str(value)
                    .map_err(|_| UriError::InvalidParameter(URI_HASH_QUERY, value.into()))?
            }
            URI_DIGITS_QUERY => {
                entry.digits = u32::from_str(value)
                    .ok()
                    .filter(|d| (1..=9).contains(d))
                    .ok_or_else(|| UriError::InvalidParameter(URI_DIGITS_QUERY, value.into()))?
            }
            URI_PERIOD_QUERY => {
                entry.period = u64::from_str(value)
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(|| UriError::InvalidParameter(URI_PERIOD_QUERY, value.into()))?
            }
            _ => (),
        }
    }

    if entry.secret.is_empty() {
        return Err(UriError::MissingSecret);
    }

    Ok(entry)
}

/// The undecoded label of an already validated otpauth URI.
fn raw_label(text: &str) -> &str {
    let after_scheme = text.split_once("://").map_or("", |(_, rest)| rest);
    let end = after_scheme
        .find(|c| c == '?' || c == '#')
        .unwrap_or(after_scheme.len());

    after_scheme[..end]
        .split_once('/')
        .map_or("", |(_, label)| label)
}
