use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

use super::{ChartRenderer, RenderError, RenderResult, RenderedChart};

static SOURCE_MARKER: &str = "# Source: ";

/// Renders charts with `helm template`.
pub struct HelmRenderer {
    pub binary: String,
    /// Directory the chart archive is unpacked from.
    pub scratch_dir: PathBuf,
}

impl Default for HelmRenderer {
    fn default() -> Self {
        Self {
            binary: "helm".to_string(),
            scratch_dir: std::env::temp_dir(),
        }
    }
}

impl HelmRenderer {

    async fn template(
        &self,
        chart: &Path,
        release: &str,
        namespace: &str,
        values: &Value,
    ) -> RenderResult<String> {
        let mut template = Command::new(&self.binary);
        template
            .args(["template", release])
            .arg(chart)
            .args(["--namespace", namespace, "--values", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = template.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            // JSON is valid YAML, helm reads it as a values file.
            stdin.write_all(&serde_json::to_vec(values)?).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(RenderError::Template(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(String::from_utf8(output.stdout)?)
    }
}

#[async_trait]
impl ChartRenderer for HelmRenderer {
    async fn render(
        &self,
        chart: &[u8],
        release: &str,
        namespace: &str,
        values: &Value,
    ) -> RenderResult<RenderedChart> {
        // Removed when dropped, including when this future is cancelled.
        let archive = tempfile::Builder::new()
            .prefix("chart-")
            .suffix(".tgz")
            .tempfile_in(&self.scratch_dir)?;
        tokio::fs::write(archive.path(), chart).await?;

        let rendered = self.template(archive.path(), release, namespace, values).await?;
        let files = split_manifests(&rendered);
        debug!(release, files = files.len(), "Rendered chart");
        Ok(RenderedChart { files })
    }
}

/// Groups `helm template` output by the template file each document came from.
/// Documents rendered from the same file are joined with a separator.
pub(crate) fn split_manifests(output: &str) -> BTreeMap<String, String> {
    let mut files: BTreeMap<String, String> = BTreeMap::new();

    for doc in output.split("\n---") {
        let doc = doc.trim_start_matches("---").trim();
        let mut lines = doc.lines();
        let Some(path) = lines.next().and_then(|l| l.strip_prefix(SOURCE_MARKER)) else {
            continue;
        };

        let body = lines.collect::<Vec<_>>().join("\n");
        if body.trim().is_empty() {
            continue;
        }

        let file = files.entry(path.trim().to_string()).or_default();
        if !file.is_empty() {
            file.push_str("\n---\n");
        }
        file.push_str(&body);
    }

    files
}
