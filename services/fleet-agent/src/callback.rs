//! Host callbacks embedded in install scripts.
//!
//! The `###docker-host-callback###<verb>` marker is not run in the
//! container. The executing layer pulls markers out and hands the verb to
//! the owning host, which runs it against the daemon before the rest of
//! the script. Text ahead of a marker on the same line stays a command.

use crate::error::{FleetError, FleetResult};

pub const SEPARATOR: &str = "###";
pub const CALLBACK_TOKEN: &str = "docker-host-callback";

pub const COMMIT: &str = "commit";
pub const PUSH: &str = "push";

/// A parsed callback request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    /// Commit the container under its image name and count the latch down.
    Commit,
    /// Push the image name to its registry.
    Push,
    /// A verb this host does not handle.
    Unknown(String),
}

/// Marker line that requests `verb` from the host.
pub fn command(verb: &str) -> String {
    format!("{SEPARATOR}{CALLBACK_TOKEN}{SEPARATOR}{verb}")
}

pub fn commit() -> String {
    command(COMMIT)
}

pub fn push() -> String {
    command(PUSH)
}

fn marker_at(line: &str) -> Option<usize> {
    line.find(&format!("{SEPARATOR}{CALLBACK_TOKEN}"))
}

/// True if the line carries the callback marker.
pub fn is_callback(line: &str) -> bool {
    marker_at(line).is_some()
}

/// Split script lines into callbacks and ordinary commands, preserving
/// order within each side.
///
/// A command sharing a line with a marker is kept, minus any trailing
/// `&&` or `;` that joined it to the marker.
pub fn partition<S: AsRef<str>>(lines: &[S]) -> (Vec<String>, Vec<String>) {
    let mut callbacks = Vec::new();
    let mut rest = Vec::new();

    for line in lines.iter().map(AsRef::as_ref) {
        let Some(at) = marker_at(line) else {
            rest.push(line.to_string());
            continue;
        };
        let before = line[..at].trim_end_matches(|c: char| c == '&' || c == ';' || c.is_whitespace());
        if !before.trim().is_empty() {
            rest.push(before.trim().to_string());
        }
        callbacks.push(line[at..].to_string());
    }

    (callbacks, rest)
}

/// Parse a marker line.
///
/// The verb is the segment after the callback token; anything before the
/// first separator is ignored. Verbs compare case-insensitively.
pub fn parse(line: &str) -> FleetResult<Callback> {
    let parts: Vec<&str> = line
        .split(SEPARATOR)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();

    let Some(token_at) = parts.iter().position(|part| *part == CALLBACK_TOKEN) else {
        return Err(FleetError::ParseFailure(format!(
            "callback marker missing token: {line}"
        )));
    };
    let Some(verb) = parts.get(token_at + 1) else {
        return Err(FleetError::ParseFailure(format!(
            "callback marker missing verb: {line}"
        )));
    };

    Ok(match verb.to_ascii_lowercase().as_str() {
        COMMIT => Callback::Commit,
        PUSH => Callback::Push,
        other => Callback::Unknown(other.to_string()),
    })
}
