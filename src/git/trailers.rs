use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metadata carried in commit trailers by engineering-manager nodes.
/// Parsed deterministically from the commit message body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitMetadata {
    pub subject: String,
    pub bead_id: String,
    pub agent_id: String,
    pub project_id: String,
    pub dispatch: u32,
    pub progress: BTreeMap<String, u64>,
}

impl CommitMetadata {
    /// Extracts trailers of the form:
    ///
    /// ```text
    /// Bead: bead-abc123
    /// Agent: agent-456
    /// Project: myapp
    /// Dispatch: 5
    /// Progress: files_modified=3, tests_run=2
    /// ```
    pub fn parse(commit_message: &str) -> Self {
        let mut meta = Self {
            subject: commit_message.lines().next().unwrap_or_default().to_string(),
            ..Default::default()
        };

        for line in commit_message.lines() {
            let line = line.trim();
            if let Some(value) = trailer_value(line, "Bead:") {
                meta.bead_id = value.to_string();
            } else if let Some(value) = trailer_value(line, "Agent:") {
                meta.agent_id = value.to_string();
            } else if let Some(value) = trailer_value(line, "Project:") {
                meta.project_id = value.to_string();
            } else if let Some(value) = trailer_value(line, "Dispatch:") {
                if let Ok(n) = value.parse() {
                    meta.dispatch = n;
                }
            } else if let Some(value) = trailer_value(line, "Progress:") {
                meta.progress = parse_progress(value);
            }
        }

        meta
    }

    /// Renders the trailer block appended to commit messages.
    pub fn to_trailers(&self) -> String {
        let progress = self
            .progress
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ");

        let mut out = format!(
            "Bead: {}\nAgent: {}\nProject: {}\nDispatch: {}",
            self.bead_id, self.agent_id, self.project_id, self.dispatch
        );
        if !progress.is_empty() {
            out.push_str(&format!("\nProgress: {}", progress));
        }
        out
    }
}

fn trailer_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix(key).map(str::trim)
}

fn parse_progress(value: &str) -> BTreeMap<String, u64> {
    let mut progress = BTreeMap::new();
    for pair in value.split(',') {
        if let Some((key, count)) = pair.split_once('=') {
            if let Ok(n) = count.trim().parse() {
                progress.insert(key.trim().to_string(), n);
            }
        }
    }
    progress
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_trailer_block() {
        let message = "Fix connection pool leak\n\nCloses the idle reaper on shutdown.\n\nBead: bead-abc123\nAgent: agent-456\nProject: myapp\nDispatch: 5\nProgress: files_modified=3, tests_run=2\n";
        let meta = CommitMetadata::parse(message);

        assert_eq!(meta.subject, "Fix connection pool leak");
        assert_eq!(meta.bead_id, "bead-abc123");
        assert_eq!(meta.agent_id, "agent-456");
        assert_eq!(meta.project_id, "myapp");
        assert_eq!(meta.dispatch, 5);
        assert_eq!(meta.progress.get("files_modified"), Some(&3));
        assert_eq!(meta.progress.get("tests_run"), Some(&2));
    }

    #[test]
    fn test_parse_without_trailers() {
        let meta = CommitMetadata::parse("Just a subject line");
        assert_eq!(meta.subject, "Just a subject line");
        assert!(meta.bead_id.is_empty());
        assert!(meta.progress.is_empty());
    }

    #[test]
    fn test_roundtrip() {
        let mut meta = CommitMetadata {
            subject: String::new(),
            bead_id: "bead-1".to_string(),
            agent_id: "agent-2".to_string(),
            project_id: "proj".to_string(),
            dispatch: 7,
            progress: BTreeMap::new(),
        };
        meta.progress.insert("files_modified".to_string(), 4);

        let message = format!("Subject\n\n{}\n", meta.to_trailers());
        let parsed = CommitMetadata::parse(&message);
        assert_eq!(parsed.bead_id, meta.bead_id);
        assert_eq!(parsed.dispatch, 7);
        assert_eq!(parsed.progress, meta.progress);
    }

    #[test]
    fn test_malformed_progress_entries_skipped() {
        let meta = CommitMetadata::parse("s\n\nProgress: files_modified=3, garbage, tests_run=x");
        assert_eq!(meta.progress.len(), 1);
        assert_eq!(meta.progress.get("files_modified"), Some(&3));
    }
}
