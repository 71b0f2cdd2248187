use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::traits::{AnalyticsSink, ErrorSink, UrlOpener};
use nodeflow_core::types::ErrorReport;

/// Logs error reports instead of showing them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, report: ErrorReport) {
        error!(title = %report.title, details = ?report.details, "Error reported");
    }
}

/// Logs analytics events at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalyticsSink;

impl AnalyticsSink for TracingAnalyticsSink {
    fn record(&self, event: &str, payload: serde_json::Value) {
        info!(event = %event, payload = %payload, "Analytics event");
    }
}

/// Opens URLs with the platform's default handler. Must be called from
/// inside a tokio runtime, which reaps the launched process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUrlOpener;

impl UrlOpener for SystemUrlOpener {
    fn open(&self, url: &str) -> Result<()> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(NodeflowError::Config(format!(
                "refusing to open non-http url: {}",
                url
            )));
        }

        let mut cmd = if cfg!(target_os = "macos") {
            let mut c = Command::new("open");
            c.arg(url);
            c
        } else if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", "start", "", url]);
            c
        } else {
            let mut c = Command::new("xdg-open");
            c.arg(url);
            c
        };

        launch(cmd)
    }
}

/// Spawn `cmd` detached and reap it in the background.
fn launch(mut cmd: Command) -> Result<()> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => debug!("URL opener exited"),
            Ok(status) => warn!(status = %status, "URL opener exited with failure"),
            Err(e) => warn!(error = %e, "Failed to wait on URL opener"),
        }
    });
    Ok(())
}
