use std::{collections::BTreeMap, io, string::FromUtf8Error};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub type RenderResult<T> = std::result::Result<T, RenderError>;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Helm command error: {0}")]
    Command(#[from] io::Error),

    #[error("Values encoding error: {0}")]
    Values(#[from] serde_json::Error),

    #[error("Helm output is not UTF-8: {0}")]
    Output(#[from] FromUtf8Error),

    #[error("helm template failed: {0}")]
    Template(String),
}

/// Manifests rendered from a chart, keyed by template path.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderedChart {
    pub files: BTreeMap<String, String>,
}

impl RenderedChart {
    /// Secret payload with one flat key per template file.
    pub fn secret_data(&self) -> BTreeMap<String, Vec<u8>> {
        self.files
            .iter()
            .map(|(path, content)| (path.replace('/', "_"), content.clone().into_bytes()))
            .collect()
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChartRenderer: Send + Sync {
    /// Renders a packaged chart archive with the given values.
    async fn render(
        &self,
        chart: &[u8],
        release: &str,
        namespace: &str,
        values: &Value,
    ) -> RenderResult<RenderedChart>;
}

pub mod render;
