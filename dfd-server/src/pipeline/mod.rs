//! Upload classification pipeline
//!
//! Receive → admit → store → classify → interpret → render. The first
//! failing stage ends the request.

pub mod admission;
pub mod classifier;
pub mod interpreter;
pub mod receiver;
pub mod renderer;
pub mod storage;

use admission::{Admission, AdmissionRejected};
use axum::extract::multipart::{Multipart, MultipartRejection};
use classifier::{ClassifierError, ProcessClassifier};
use dfd_common::config::{ServiceConfig, VerdictMode};
use interpreter::{UnrecognizedOutput, Verdict};
use receiver::{FileReceiver, ReceiveError};
use renderer::{TemplateError, TemplateRenderer};
use std::time::Duration;
use storage::{StorageError, StoredUpload, UploadStore, UploadedAsset};
use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{info, warn};

/// Everything that can end a request early
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("form parse failed: {0}")]
    FormParse(String),

    #[error("upload has no file part")]
    FileFieldMissing,

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("server busy: {0}")]
    Busy(#[from] AdmissionRejected),

    #[error(transparent)]
    DirectoryCreation(StorageError),

    #[error(transparent)]
    Write(StorageError),

    #[error(transparent)]
    ClassifierProcess(ClassifierError),

    #[error("classifier timed out after {}s", .0.as_secs())]
    ClassifierTimeout(Duration),

    #[error(transparent)]
    UnrecognizedOutput(#[from] UnrecognizedOutput),

    #[error(transparent)]
    TemplateLoad(#[from] TemplateError),
}

impl From<ReceiveError> for PipelineError {
    fn from(err: ReceiveError) -> Self {
        match err {
            ReceiveError::Malformed(detail) => PipelineError::FormParse(detail),
            ReceiveError::MissingFile => PipelineError::FileFieldMissing,
            ReceiveError::UnsupportedType(name) => PipelineError::UnsupportedFileType(name),
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DirectoryCreation { .. } => PipelineError::DirectoryCreation(err),
            StorageError::Write { .. } | StorageError::Scan { .. } => PipelineError::Write(err),
        }
    }
}

impl From<ClassifierError> for PipelineError {
    fn from(err: ClassifierError) -> Self {
        match err {
            ClassifierError::TimedOut(timeout) => PipelineError::ClassifierTimeout(timeout),
            other => PipelineError::ClassifierProcess(other),
        }
    }
}

/// Successful run
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub asset: UploadedAsset,
    pub verdict: Verdict,
    pub html: String,
}

/// All pipeline stages, shared by every request
#[derive(Debug)]
pub struct Pipeline {
    receiver: FileReceiver,
    admission: Admission,
    store: UploadStore,
    classifier: ProcessClassifier,
    verdict_mode: VerdictMode,
    renderer: TemplateRenderer,
}

impl Pipeline {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            receiver: FileReceiver::new(config.allowed_extensions.clone()),
            admission: Admission::new(
                config.classifier.max_concurrent,
                config.classifier.admission_wait,
                config.classifier.max_waiting,
            ),
            store: UploadStore::new(
                config.uploads_dir.clone(),
                config.storage_naming,
                config.retention.clone(),
            ),
            classifier: ProcessClassifier::from_config(&config.classifier),
            verdict_mode: config.verdict_mode,
            renderer: TemplateRenderer::new(config.template_path.clone()),
        }
    }

    pub fn store(&self) -> &UploadStore {
        &self.store
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Run one upload through every stage
    pub async fn run(
        &self,
        multipart: Result<Multipart, MultipartRejection>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let upload = self.receiver.receive(multipart).await?;

        // Held until the classifier exits; rejected requests never touch disk
        let permit = self.admission.acquire().await?;

        let stored = self.store.store(&upload).await?;
        if let Err(e) = self.store.enforce_retention().await {
            warn!("Retention pass after store failed: {}", e);
        }

        let outcome = self.classify_and_render(&stored, permit).await;
        let asset = stored.asset().clone();
        stored.release().await;

        let (verdict, html) = outcome?;
        Ok(PipelineOutcome {
            asset,
            verdict,
            html,
        })
    }

    async fn classify_and_render(
        &self,
        stored: &StoredUpload,
        permit: OwnedSemaphorePermit,
    ) -> Result<(Verdict, String), PipelineError> {
        let invocation = self.classifier.classify(stored.path()).await?;
        drop(permit);

        let verdict = interpreter::interpret_with(self.verdict_mode, &invocation.raw_output)?;
        info!(
            declared_name = %stored.asset().declared_name,
            stored_path = %stored.path().display(),
            label = %verdict.label,
            is_fake = verdict.is_fake,
            "Upload classified"
        );

        let html = self.renderer.render(&verdict).await?;
        Ok((verdict, html))
    }
}
