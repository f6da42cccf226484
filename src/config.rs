use std::path::PathBuf;

use clap::Parser;

use crate::qr::DEFAULT_MAX_IMAGE_BYTES;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DATA_FILE: &str = "data/2fa_data.json";

/// Runtime configuration. Priority: CLI argument > environment variable > default.
#[derive(Debug, Clone, Parser)]
#[command(name = "otpboard", version, about = "Serve TOTP codes for a shared set of credentials")]
pub struct Config {
    /// Address to bind the HTTP server to
    #[arg(long, env = "OTPBOARD_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// JSON file holding every credential, deleted ones included
    #[arg(long, env = "OTPBOARD_DATA_FILE", default_value = DEFAULT_DATA_FILE)]
    pub data_file: PathBuf,

    /// Largest QR image upload accepted, in bytes
    #[arg(long, env = "OTPBOARD_MAX_IMAGE_BYTES", default_value_t = DEFAULT_MAX_IMAGE_BYTES)]
    pub max_image_bytes: usize,

    /// Log filter used when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, env = "OTPBOARD_LOG")]
    pub log_level: Option<String>,
}

impl Config {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn log_filter(&self) -> String {
        match self.log_level.as_deref().filter(|l| !l.trim().is_empty()) {
            Some(level) => level.to_string(),
            None => "info,otpboard=debug".to_string(),
        }
    }
}
