//! Append-only JSONL run event log.

use crate::core::error::StateError;
use crate::core::types::{RunEvent, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Generate an ISO 8601 UTC timestamp.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Generate a random v4 UUID with the given prefix.
pub fn generate_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Generate a run ID (also used as the lock owner token).
pub fn generate_run_id() -> String {
    generate_id("r")
}

/// Derive the event log path for an environment.
pub fn event_log_path(state_dir: &Path, environment: &str) -> PathBuf {
    state_dir.join(environment).join("events.jsonl")
}

/// Append an event to the environment's event log.
pub fn append_event(state_dir: &Path, environment: &str, event: RunEvent) -> Result<(), StateError> {
    let path = event_log_path(state_dir, environment);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let mut line = serde_json::to_string(&te)?;
    line.push('\n');

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| StateError::io(&path, e))?;

    // one write per line so concurrent appenders never interleave
    file.write_all(line.as_bytes())
        .map_err(|e| StateError::io(&path, e))?;

    Ok(())
}

/// Read every event back, oldest first. A missing log is empty.
pub fn read_events(state_dir: &Path, environment: &str) -> Result<Vec<TimestampedEvent>, StateError> {
    let path = event_log_path(state_dir, environment);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path).map_err(|e| StateError::io(&path, e))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| StateError::corrupt(&path, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_iso8601() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }

    #[test]
    fn test_generate_run_id_unique() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert!(a.starts_with("r-"));
        assert_eq!(a.len(), 34);
        assert_ne!(a, b);
        assert!(a[2..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_event_log_path() {
        let p = event_log_path(Path::new("/state"), "staging");
        assert_eq!(p, PathBuf::from("/state/staging/events.jsonl"));
    }

    #[test]
    fn test_append_and_read_events() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            let event = RunEvent::StepSucceeded {
                run_id: "r-abc".to_string(),
                address: format!("network.n{}", i),
                operation: "create".to_string(),
                version: Some(1),
                duration_seconds: 0.5,
            };
            append_event(dir.path(), "default", event).unwrap();
        }
        let content = std::fs::read_to_string(dir.path().join("default/events.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(content.contains("\"event\":\"step_succeeded\""));

        let events = read_events(dir.path(), "default").unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0].event, RunEvent::StepSucceeded { .. }));
    }

    #[test]
    fn test_read_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_events(dir.path(), "nope").unwrap().is_empty());
    }
}
