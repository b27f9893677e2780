//! Structured parsing of inventory output
//!
//! Parsing never fails outright. A malformed line still yields a record with
//! `"unknown"` placeholders, and the overall result is tagged as degraded.

use crate::commands::{FIELD_SEPARATOR, INVENTORY_FIELDS};
use serde::{Deserialize, Serialize};

/// Placeholder for fields that could not be read
pub const UNKNOWN: &str = "unknown";

/// A parse outcome: clean, or best-effort with the reason it is incomplete
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed<T> {
    Parsed(T),
    Degraded { value: T, reason: String },
}

impl<T> Parsed<T> {
    pub fn value(&self) -> &T {
        match self {
            Self::Parsed(value) | Self::Degraded { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Self::Parsed(value) | Self::Degraded { value, .. } => value,
        }
    }

    pub fn degraded_reason(&self) -> Option<&str> {
        match self {
            Self::Parsed(_) => None,
            Self::Degraded { reason, .. } => Some(reason),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// One container as reported by the inventory command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Free-text state, e.g. `running`, `exited`, `Up 3 hours`
    pub status: String,
    #[serde(default)]
    pub running: Option<bool>,
    /// Restart policy name; empty or `no` means none
    #[serde(default)]
    pub restart_policy: String,
    #[serde(default)]
    pub created: String,
    /// Why this record is incomplete, if it is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl ContainerInfo {
    /// Case-insensitive: status starts with or contains an `up`/`running` marker.
    #[must_use]
    pub fn is_running(&self) -> bool {
        if let Some(running) = self.running {
            return running;
        }
        status_is_running(&self.status)
    }

    /// Restart policy is set and is not `no`.
    #[must_use]
    pub fn has_auto_restart(&self) -> bool {
        let policy = self.restart_policy.trim();
        !policy.is_empty() && !policy.eq_ignore_ascii_case("no") && policy != UNKNOWN
    }
}

/// Running classification of free-text container status
#[must_use]
pub fn status_is_running(status: &str) -> bool {
    let status = status.trim().to_ascii_lowercase();
    status.starts_with("up")
        || status
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| word == "up" || word == "running")
}

/// Parse `id|name|image|status|running|restart_policy|created` lines.
#[must_use]
pub fn parse_inventory(output: &str) -> Parsed<Vec<ContainerInfo>> {
    let mut containers = Vec::new();
    let mut problems = Vec::new();

    for (index, line) in output.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let line_no = index + 1;
        let (container, problem) = parse_line(line, line_no);
        if let Some(problem) = problem {
            problems.push(problem);
        }
        containers.push(container);
    }

    if problems.is_empty() {
        Parsed::Parsed(containers)
    } else {
        Parsed::Degraded {
            value: containers,
            reason: format!("{} malformed line(s): {}", problems.len(), problems.join("; ")),
        }
    }
}

fn parse_line(line: &str, line_no: usize) -> (ContainerInfo, Option<String>) {
    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).map(str::trim).collect();
    let field = |i: usize| {
        fields
            .get(i)
            .copied()
            .filter(|f| !f.is_empty())
            .map_or_else(|| UNKNOWN.to_string(), str::to_string)
    };

    let mut problem = None;
    if fields.len() != INVENTORY_FIELDS {
        problem = Some(format!(
            "line {line_no}: expected {INVENTORY_FIELDS} fields, got {}",
            fields.len()
        ));
    }

    let mut id = field(0);
    if id == UNKNOWN {
        id = format!("{UNKNOWN}-{line_no}");
        problem.get_or_insert_with(|| format!("line {line_no}: missing container id"));
    }

    let running = match fields.get(4).copied() {
        Some("true") => Some(true),
        Some("false") => Some(false),
        _ => None,
    };

    let container = ContainerInfo {
        id,
        name: field(1).trim_start_matches('/').to_string(),
        image: field(2),
        status: field(3),
        running,
        restart_policy: fields.get(5).copied().unwrap_or(UNKNOWN).to_string(),
        created: field(6),
        degraded: problem.clone(),
    };
    (container, problem)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = "abc123|/web|nginx:1.25|running|true|unless-stopped|2024-01-01T00:00:00Z";

    #[test]
    fn test_parse_clean_output() {
        let output = format!("{LINE}\nfff999|/cron|alpine|exited|false||2024-01-02T00:00:00Z\n");
        let parsed = parse_inventory(&output);
        assert!(!parsed.is_degraded());

        let containers = parsed.into_value();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "web");
        assert_eq!(containers[0].image, "nginx:1.25");
        assert!(containers[0].is_running());
        assert!(containers[0].has_auto_restart());
        assert!(!containers[1].is_running());
        assert!(!containers[1].has_auto_restart());
    }

    #[test]
    fn test_empty_output_is_clean_and_empty() {
        let parsed = parse_inventory("\n\n");
        assert_eq!(parsed, Parsed::Parsed(Vec::new()));
    }

    #[test]
    fn test_malformed_line_degrades_but_is_kept() {
        let output = format!("{LINE}\ngarbage without separators\n");
        let parsed = parse_inventory(&output);
        assert!(parsed.is_degraded());
        assert!(parsed.degraded_reason().unwrap().contains("line 2"));

        let containers = parsed.value();
        assert_eq!(containers.len(), 2);
        let broken = &containers[1];
        assert_eq!(broken.id, "garbage without separators");
        assert_eq!(broken.image, UNKNOWN);
        assert_eq!(broken.status, UNKNOWN);
        assert!(broken.degraded.is_some());
    }

    #[test]
    fn test_missing_id_gets_placeholder() {
        let parsed = parse_inventory("|/web|nginx|running|true|always|x");
        let containers = parsed.value();
        assert_eq!(containers[0].id, "unknown-1");
        assert!(parsed.is_degraded());
    }

    #[test]
    fn test_status_classification() {
        assert!(status_is_running("Up 3 hours"));
        assert!(status_is_running("up"));
        assert!(status_is_running("RUNNING"));
        assert!(status_is_running("Restarting (1) 5 seconds ago, up"));
        assert!(!status_is_running("Exited (0) 2 hours ago"));
        assert!(!status_is_running("created"));
        assert!(!status_is_running("dead"));
        assert!(!status_is_running(""));
    }

    #[test]
    fn test_status_text_used_when_running_flag_missing() {
        let container = ContainerInfo {
            id: "a".to_string(),
            name: "a".to_string(),
            image: "a".to_string(),
            status: "Up 2 minutes".to_string(),
            running: None,
            restart_policy: "no".to_string(),
            created: String::new(),
            degraded: None,
        };
        assert!(container.is_running());
        assert!(!container.has_auto_restart());
    }

    #[test]
    fn test_degraded_marker_serialization() {
        let clean = parse_inventory(LINE).into_value().remove(0);
        let json = serde_json::to_value(&clean).unwrap();
        assert!(json.get("degraded").is_none());
        let back: ContainerInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, clean);
    }
}
