//! Shared output layer for human/JSON parity across all `mview` commands.
//!
//! Every command handler receives an [`OutputMode`]. Results go to stdout,
//! errors to stderr, and JSON mode always emits a single document.

use crate::cmd::NotInitialized;
use mview_core::error::{ErrorCode, UpdateError};
use mview_core::lock::LockError;
use serde::Serialize;
use std::io::{self, Write};

/// Render a left-aligned key/value line in human output.
pub fn pretty_kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    writeln!(w, "{:<14} {}", format!("{key}:"), value.as_ref())
}

/// Output modes supported by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-readable lines.
    Human,
    /// Machine-readable JSON.
    Json,
}

impl OutputMode {
    /// Returns `true` if JSON output was requested.
    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// A structured error with optional suggestion and error code.
#[derive(Debug, Serialize)]
pub struct CliError {
    /// Human-readable error message.
    pub message: String,
    /// Optional suggestion for how to fix the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Machine-readable error code (e.g. `E4001`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl CliError {
    /// Create an error with a suggestion and error code.
    pub fn with_details(
        message: impl Into<String>,
        suggestion: impl Into<String>,
        error_code: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            suggestion: Some(suggestion.into()),
            error_code: Some(error_code.into()),
        }
    }

    /// Build from any command failure, surfacing the machine code and hint
    /// when the chain contains an [`UpdateError`] or [`LockError`].
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let code = err.chain().find_map(|cause| {
            cause
                .downcast_ref::<UpdateError>()
                .map(UpdateError::code)
                .or_else(|| cause.downcast_ref::<LockError>().map(LockError::code))
                .or_else(|| {
                    cause
                        .downcast_ref::<NotInitialized>()
                        .map(|_| ErrorCode::NotInitialized)
                })
        });
        Self {
            message: format!("{err:#}"),
            suggestion: code.and_then(ErrorCode::hint).map(str::to_string),
            error_code: code.map(|c| c.code().to_string()),
        }
    }
}

/// Render a serializable value to stdout in the requested format.
///
/// In JSON mode the value is serialized with `serde_json`; otherwise
/// `human_fn` writes the text form.
pub fn render<T: Serialize>(
    mode: OutputMode,
    value: &T,
    human_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_rendered(&mut out, mode, value, human_fn)
}

fn write_rendered<T: Serialize>(
    out: &mut dyn Write,
    mode: OutputMode,
    value: &T,
    human_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut *out, value)?;
            writeln!(out)?;
        }
        OutputMode::Human => human_fn(value, out)?,
    }
    Ok(())
}

/// Render an error to stderr in the requested format.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    let stderr = io::stderr();
    let mut out = stderr.lock();
    write_error(&mut out, mode, error)
}

fn write_error(out: &mut dyn Write, mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    match mode {
        OutputMode::Json => {
            let wrapper = serde_json::json!({
                "error": error,
            });
            serde_json::to_writer_pretty(&mut *out, &wrapper)?;
            writeln!(out)?;
        }
        OutputMode::Human => {
            match &error.error_code {
                Some(code) => writeln!(out, "error[{code}]: {}", error.message)?,
                None => writeln!(out, "error: {}", error.message)?,
            }
            if let Some(ref suggestion) = error.suggestion {
                writeln!(out, "  suggestion: {suggestion}")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered_error(mode: OutputMode, error: &CliError) -> String {
        let mut buf = Vec::new();
        write_error(&mut buf, mode, error).expect("render error");
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn human_error_includes_code_and_suggestion() {
        let err = CliError::with_details("view is locked", "retry later", "E5002");
        let text = rendered_error(OutputMode::Human, &err);
        assert!(text.starts_with("error[E5002]: view is locked"));
        assert!(text.contains("suggestion: retry later"));
    }

    #[test]
    fn json_error_is_wrapped() {
        let err = CliError::with_details("view is locked", "retry later", "E5002");
        let value: serde_json::Value =
            serde_json::from_str(&rendered_error(OutputMode::Json, &err)).expect("json");
        assert_eq!(value["error"]["error_code"], "E5002");
        assert_eq!(value["error"]["suggestion"], "retry later");
    }

    #[test]
    fn update_error_in_chain_supplies_code() {
        let err = anyhow::Error::new(UpdateError::ResourceExhausted {
            usage: 95,
            limit: 100,
            threshold_percent: 90,
        })
        .context("update catalog");
        let cli = CliError::from_anyhow(&err);
        assert_eq!(cli.error_code.as_deref(), Some("E4001"));
        assert!(cli.suggestion.is_some());
        assert!(cli.message.starts_with("update catalog"));
    }

    #[test]
    fn missing_database_maps_to_not_initialized() {
        let err = anyhow::Error::new(NotInitialized {
            path: ".mview/mview.db".into(),
        });
        let cli = CliError::from_anyhow(&err);
        assert_eq!(cli.error_code.as_deref(), Some("E1001"));
        assert!(cli.suggestion.is_some_and(|s| s.contains("mview init")));
    }

    #[test]
    fn plain_errors_have_no_code() {
        let cli = CliError::from_anyhow(&anyhow::anyhow!("boom"));
        assert!(cli.error_code.is_none());
        assert_eq!(cli.message, "boom");
    }

    #[test]
    fn json_mode_serializes_value() {
        let mut buf = Vec::new();
        write_rendered(&mut buf, OutputMode::Json, &serde_json::json!({"lag": 3}), |_, _| {
            Ok(())
        })
        .expect("render");
        let value: serde_json::Value = serde_json::from_slice(&buf).expect("json");
        assert_eq!(value["lag"], 3);
        assert!(OutputMode::Json.is_json());
        assert!(!OutputMode::Human.is_json());
    }
}
