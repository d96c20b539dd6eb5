//! File Receiver
//!
//! Parses the multipart upload, drains every part (so a body over the size
//! ceiling fails here, before anything touches the disk), and extracts the
//! part named `file`.

use axum::body::Bytes;
use axum::extract::multipart::{Multipart, MultipartRejection};
use thiserror::Error;
use tracing::debug;

/// Name of the multipart part carrying the video
pub const FILE_FIELD: &str = "file";

/// File Receiver errors
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// Not multipart, malformed encoding, or body ceiling exceeded
    #[error("malformed multipart body: {0}")]
    Malformed(String),

    /// No `file` part carrying a filename
    #[error("no '{}' part with a filename in request", FILE_FIELD)]
    MissingFile,

    /// Declared extension is not in the allow-list
    #[error("file type not accepted: {0}")]
    UnsupportedType(String),
}

/// Upload extracted from the request body
#[derive(Debug, Clone)]
pub struct ReceivedUpload {
    /// Client-declared filename, untrusted
    pub declared_name: String,
    pub bytes: Bytes,
}

impl ReceivedUpload {
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Extracts the uploaded file from a multipart request
#[derive(Debug, Clone, Default)]
pub struct FileReceiver {
    /// Lowercase extensions without the dot; empty accepts everything
    allowed_extensions: Vec<String>,
}

impl FileReceiver {
    pub fn new(allowed_extensions: Vec<String>) -> Self {
        Self { allowed_extensions }
    }

    /// Read the whole multipart body and return the first `file` part that
    /// carries a filename.
    pub async fn receive(
        &self,
        multipart: Result<Multipart, MultipartRejection>,
    ) -> Result<ReceivedUpload, ReceiveError> {
        let mut multipart = multipart.map_err(|e| ReceiveError::Malformed(e.to_string()))?;
        let mut upload: Option<ReceivedUpload> = None;
        let mut parts = 0usize;

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ReceiveError::Malformed(e.to_string()))?
        {
            parts += 1;
            let is_file_part = field.name() == Some(FILE_FIELD);
            // A part without a filename is a plain form value, not a file
            let declared_name = field
                .file_name()
                .filter(|name| !name.is_empty())
                .map(str::to_owned);

            let bytes = field
                .bytes()
                .await
                .map_err(|e| ReceiveError::Malformed(e.to_string()))?;

            if upload.is_none() && is_file_part {
                if let Some(declared_name) = declared_name {
                    upload = Some(ReceivedUpload {
                        declared_name,
                        bytes,
                    });
                }
            }
        }

        let upload = upload.ok_or(ReceiveError::MissingFile)?;

        debug!(
            declared_name = %upload.declared_name,
            size_bytes = upload.size_bytes(),
            parts,
            "Multipart upload received"
        );

        if !self.is_allowed(&upload.declared_name) {
            return Err(ReceiveError::UnsupportedType(upload.declared_name));
        }

        Ok(upload)
    }

    /// Extension check on the declared name (text after the last dot)
    pub fn is_allowed(&self, declared_name: &str) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        match declared_name.rsplit_once('.') {
            Some((_, ext)) => {
                let ext = ext.to_ascii_lowercase();
                self.allowed_extensions.iter().any(|allowed| *allowed == ext)
            }
            None => false,
        }
    }
}
