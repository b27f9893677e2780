//! Snapshot naming, listing and retention

use crate::JobError;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

/// Tag format of snapshot images
pub const TAG_FORMAT: &str = "%Y%m%d%H%M%S";

static CONTAINER_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,127}$").ok());

/// Reject anything that is not a plain Docker container name.
///
/// Names are interpolated into remote shell commands.
///
/// # Errors
///
/// Returns [`JobError::InvalidContainerName`] when `name` does not match.
pub fn validate_container_name(name: &str) -> Result<(), JobError> {
    if CONTAINER_NAME
        .as_ref()
        .is_some_and(|re| re.is_match(name))
    {
        Ok(())
    } else {
        Err(JobError::InvalidContainerName(name.to_string()))
    }
}

/// Image repository holding the snapshots of `container`
#[must_use]
pub fn repository_for(prefix: &str, container: &str) -> String {
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        container.to_ascii_lowercase()
    )
}

/// Tag for a snapshot taken at `at`
#[must_use]
pub fn tag_for(at: DateTime<Utc>) -> String {
    at.format(TAG_FORMAT).to_string()
}

/// Container id lookup by exact name.
///
/// Docker matches the name filter as a regex; dots in a validated name are
/// the only metacharacters and are escaped.
#[must_use]
pub fn find_container_command(name: &str) -> String {
    let pattern = name.replace('.', r"\.");
    format!("docker ps -a --filter 'name=^/{pattern}$' --format '{{{{.ID}}}}'")
}

#[must_use]
pub fn commit_command(container_id: &str, image: &str) -> String {
    format!("docker commit {container_id} {image}")
}

/// One `tag|created` line per snapshot of `repository`
#[must_use]
pub fn list_command(repository: &str) -> String {
    format!("docker images {repository} --format '{{{{.Tag}}}}|{{{{.CreatedAt}}}}'")
}

#[must_use]
pub fn remove_command(image: &str) -> String {
    format!("docker rmi {image}")
}

/// An existing snapshot image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotImage {
    pub tag: String,
    /// `None` when neither the listing nor the tag yields a time
    pub created: Option<DateTime<Utc>>,
}

/// Parse the output of [`list_command`].
#[must_use]
pub fn parse_snapshot_list(output: &str) -> Vec<SnapshotImage> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (tag, created) = line.split_once('|').unwrap_or((line, ""));
            let tag = tag.trim();
            if tag.is_empty() || tag == "<none>" {
                return None;
            }
            let created = parse_created_at(created).or_else(|| parse_tag(tag));
            Some(SnapshotImage {
                tag: tag.to_string(),
                created,
            })
        })
        .collect()
}

/// `2024-01-01 02:00:00 +0000 UTC`; only the first three tokens matter
fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    let tokens: Vec<&str> = raw.split_whitespace().take(3).collect();
    if tokens.len() < 3 {
        return None;
    }
    DateTime::parse_from_str(&tokens.join(" "), "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_tag(tag: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(tag, TAG_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Snapshots beyond the newest `retention`, oldest last.
///
/// Images without a known creation time are never pruned. At least one
/// snapshot is always kept.
#[must_use]
pub fn select_prunable(snapshots: &[SnapshotImage], retention: u32) -> Vec<&SnapshotImage> {
    let mut dated: Vec<&SnapshotImage> = snapshots.iter().filter(|s| s.created.is_some()).collect();
    dated.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.tag.cmp(&a.tag)));
    let keep = usize::try_from(retention.max(1)).unwrap_or(usize::MAX);
    dated.into_iter().skip(keep).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(tag: &str) -> SnapshotImage {
        SnapshotImage {
            tag: tag.to_string(),
            created: parse_tag(tag),
        }
    }

    #[test]
    fn test_validate_container_name() {
        assert!(validate_container_name("api").is_ok());
        assert!(validate_container_name("web_1.blue-green").is_ok());
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("-leading").is_err());
        assert!(validate_container_name("api; rm -rf /").is_err());
        assert!(validate_container_name("a'b").is_err());
    }

    #[test]
    fn test_names_and_commands() {
        assert_eq!(repository_for("snapshots/", "Api"), "snapshots/api");
        let at = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(tag_for(at), "20240102030405");
        assert_eq!(
            find_container_command("api"),
            "docker ps -a --filter 'name=^/api$' --format '{{.ID}}'"
        );
        assert_eq!(
            find_container_command("web.1"),
            r"docker ps -a --filter 'name=^/web\.1$' --format '{{.ID}}'"
        );
        assert_eq!(
            list_command("snapshots/api"),
            "docker images snapshots/api --format '{{.Tag}}|{{.CreatedAt}}'"
        );
    }

    #[test]
    fn test_parse_snapshot_list() {
        let output = "20240103000000|2024-01-03 00:00:05 +0000 UTC\n\
                      20240102000000|garbage\n\
                      latest|\n\
                      <none>|2024-01-01 00:00:00 +0000 UTC\n";
        let images = parse_snapshot_list(output);
        assert_eq!(images.len(), 3);
        assert_eq!(
            images[0].created.unwrap().to_rfc3339(),
            "2024-01-03T00:00:05+00:00"
        );
        // Falls back to the tag
        assert_eq!(
            images[1].created.unwrap().to_rfc3339(),
            "2024-01-02T00:00:00+00:00"
        );
        assert_eq!(images[2].created, None);
    }

    #[test]
    fn test_parse_created_at_with_offset() {
        let created = parse_created_at("2024-01-01 02:00:00 +0200 CEST").unwrap();
        assert_eq!(created.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_prune_oldest_beyond_retention() {
        let snapshots: Vec<SnapshotImage> = (1..=7)
            .map(|day| image(&format!("202401{day:02}000000")))
            .collect();
        let prunable: Vec<&str> = select_prunable(&snapshots, 5)
            .iter()
            .map(|s| s.tag.as_str())
            .collect();
        assert_eq!(prunable, vec!["20240102000000", "20240101000000"]);
    }

    #[test]
    fn test_prune_ignores_listing_order() {
        let snapshots: Vec<SnapshotImage> = [4, 1, 7, 2, 6, 3, 5]
            .iter()
            .map(|day| image(&format!("202401{day:02}000000")))
            .collect();
        let mut prunable: Vec<&str> = select_prunable(&snapshots, 5)
            .iter()
            .map(|s| s.tag.as_str())
            .collect();
        prunable.sort_unstable();
        assert_eq!(prunable, vec!["20240101000000", "20240102000000"]);
    }

    #[test]
    fn test_prune_keeps_undated_and_at_least_one() {
        let snapshots = vec![
            image("20240101000000"),
            image("20240102000000"),
            image("latest"),
        ];
        let prunable = select_prunable(&snapshots, 0);
        assert_eq!(prunable.len(), 1);
        assert_eq!(prunable[0].tag, "20240101000000");
        assert!(select_prunable(&snapshots, 5).is_empty());
    }
}
