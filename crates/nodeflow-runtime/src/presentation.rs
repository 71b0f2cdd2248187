//! Read-only projections consumed by the rendering layer.

use nodeflow_core::template::AuthValue;
use nodeflow_core::types::{BuildStatus, ConnectionState, ValidationResult};

/// What the status slot next to the node title shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusIndicator {
    /// Elapsed time of a successful build.
    Duration(String),
    Spinner,
    Success,
    Alert,
    Neutral,
}

pub fn status_indicator(status: BuildStatus, validation: Option<&ValidationResult>) -> StatusIndicator {
    match (status, validation) {
        (BuildStatus::Built, Some(v)) if v.success => match v.duration_ms {
            Some(ms) => StatusIndicator::Duration(format_duration(ms)),
            None => StatusIndicator::Success,
        },
        (BuildStatus::Built, Some(_)) => StatusIndicator::Alert,
        (BuildStatus::Built, None) => StatusIndicator::Success,
        (BuildStatus::Building, _) => StatusIndicator::Spinner,
        (BuildStatus::Error, _) => StatusIndicator::Alert,
        (BuildStatus::Idle, _) => StatusIndicator::Neutral,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunIcon {
    Play,
    Spinner,
    Stop,
}

pub fn run_icon(status: BuildStatus, hovered: bool) -> RunIcon {
    match (status, hovered) {
        (BuildStatus::Building, true) => RunIcon::Stop,
        (BuildStatus::Building, false) => RunIcon::Spinner,
        _ => RunIcon::Play,
    }
}

pub fn run_tooltip(status: BuildStatus, hovered: bool) -> &'static str {
    if status == BuildStatus::Building && hovered {
        "Stop build"
    } else {
        "Run component"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectIcon {
    Spinner,
    Link,
    Alert,
}

/// Projection of the connect affordance for nodes with an auth field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectButton {
    pub state: ConnectionState,
    pub icon: ConnectIcon,
    pub disabled: bool,
    pub test_id: String,
}

impl ConnectButton {
    /// `polling` is a live session for this field. `busy` also covers an
    /// in-flight disconnect and only drives the spinner.
    pub fn derive(
        display_name: &str,
        auth: &AuthValue,
        polling: bool,
        busy: bool,
        has_api_key: bool,
    ) -> Self {
        let state = ConnectionState::derive(polling, auth);
        let authenticated = auth.is_connected();

        let icon = if busy {
            ConnectIcon::Spinner
        } else if authenticated {
            ConnectIcon::Link
        } else {
            ConnectIcon::Alert
        };

        let disabled = auth.is_error() || (auth.link().is_empty() && !has_api_key);

        let slug = display_name.to_lowercase();
        let test_id = if authenticated && !busy {
            format!("button_connected_{}", slug)
        } else if auth.is_error() {
            format!("button_error_{}", slug)
        } else {
            format!("button_disconnected_{}", slug)
        };

        Self {
            state,
            icon,
            disabled,
            test_id,
        }
    }
}

/// Warning shown when a node's recorded version is behind and the update breaks it.
pub fn needs_update_warning(outdated: bool, user_edited: bool, dismissed: bool, breaking: bool) -> bool {
    outdated && !user_edited && !dismissed && breaking
}

/// Render milliseconds as `842 ms`, `1.5 s`, `12 s` or `2 min 5 s`.
pub fn format_duration(ms: u64) -> String {
    if ms < 1_000 {
        return format!("{} ms", ms);
    }
    let tenths = (ms + 50) / 100;
    if tenths < 600 {
        return if tenths % 10 == 0 {
            format!("{} s", tenths / 10)
        } else {
            format!("{}.{} s", tenths / 10, tenths % 10)
        };
    }
    let total_secs = (ms + 500) / 1_000;
    let (mins, secs) = (total_secs / 60, total_secs % 60);
    if secs == 0 {
        format!("{} min", mins)
    } else {
        format!("{} min {} s", mins, secs)
    }
}

/// Multi-line summary for the status tooltip.
pub fn validation_summary(
    status: BuildStatus,
    validation: Option<&ValidationResult>,
    last_run_time: Option<&str>,
) -> String {
    let mut lines = Vec::new();

    match (status, validation) {
        (BuildStatus::Building, _) => lines.push("Building...".to_string()),
        (_, None) => lines.push("Run component to see status".to_string()),
        (_, Some(v)) if v.success => {
            lines.push("Build successful".to_string());
            if let Some(ms) = v.duration_ms {
                lines.push(format!("Duration: {}", format_duration(ms)));
            }
        }
        (_, Some(v)) => {
            lines.push("Build failed".to_string());
            if let Some(msg) = &v.error_message {
                lines.extend(msg.lines().map(str::to_string));
            }
        }
    }

    if let Some(when) = last_run_time {
        lines.push(format!("Last run: {}", when));
    }

    lines.join("\n")
}
