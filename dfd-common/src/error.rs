//! Errors raised while assembling the service configuration

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Config file exists but could not be read
    #[error("cannot read config file {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for the known settings
    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    /// A resolved setting failed validation
    #[error("configuration error: {0}")]
    Config(String),

    /// Unrecognized value for an enumerated setting
    #[error("invalid setting: {0}")]
    InvalidInput(String),
}
