//! Result Renderer
//!
//! Fills the result page template with a [`Verdict`]. Templates use
//! minijinja syntax and see three values: `Result`, `Confidence` and
//! `IsFake`. Substituted values are always HTML-escaped, and referencing any
//! other name is an error.

use super::interpreter::Verdict;
use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Result Renderer errors
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Template file missing or unreadable
    #[error("cannot read template {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Template text does not compile
    #[error("invalid template {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: minijinja::Error,
    },

    /// Template references something the result page does not provide
    #[error("cannot render template {}: {source}", .path.display())]
    Render {
        path: PathBuf,
        #[source]
        source: minijinja::Error,
    },
}

/// Values visible to the template
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ResultPage<'a> {
    result: &'a str,
    confidence: &'a str,
    is_fake: bool,
}

impl<'a> From<&'a Verdict> for ResultPage<'a> {
    fn from(verdict: &'a Verdict) -> Self {
        Self {
            result: &verdict.label,
            confidence: &verdict.confidence_text,
            is_fake: verdict.is_fake,
        }
    }
}

/// Renders the result page. The template file is read on every call, so
/// edits on disk take effect without a restart.
#[derive(Debug)]
pub struct TemplateRenderer {
    path: PathBuf,
    env: Environment<'static>,
}

impl TemplateRenderer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self {
            path: path.into(),
            env,
        }
    }

    pub async fn render(&self, verdict: &Verdict) -> Result<String, TemplateError> {
        let source = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| TemplateError::Read {
                path: self.path.clone(),
                source,
            })?;

        let html = self.render_source(&source, verdict)?;
        debug!(
            template = %self.path.display(),
            is_fake = verdict.is_fake,
            html_bytes = html.len(),
            "Result rendered"
        );
        Ok(html)
    }

    fn render_source(&self, source: &str, verdict: &Verdict) -> Result<String, TemplateError> {
        let template = self
            .env
            .template_from_str(source)
            .map_err(|source| TemplateError::Parse {
                path: self.path.clone(),
                source,
            })?;

        template
            .render(ResultPage::from(verdict))
            .map_err(|source| TemplateError::Render {
                path: self.path.clone(),
                source,
            })
    }
}
