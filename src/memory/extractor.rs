use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::embedder::Embedder;
use super::lesson::{Lesson, LessonCategory, LessonStore};

/// A flattened action result for extraction analysis. The dispatcher converts
/// from its internal transcript representation.
#[derive(Debug, Clone)]
pub struct ActionEntry {
    pub iteration: u32,
    pub action_type: String,
    pub status: String,
    pub message: String,
    pub path: String,
}

impl ActionEntry {
    fn is_error(&self) -> bool {
        self.status == "error"
    }
}

/// Mines durable lessons from the action transcript of a completed run.
/// Invoked after every terminal workflow transition.
pub struct LessonExtractor {
    store: Arc<dyn LessonStore>,
    embedder: Arc<dyn Embedder>,
}

struct MinedLesson {
    category: LessonCategory,
    title: String,
    detail: String,
}

impl LessonExtractor {
    pub fn new(store: Arc<dyn LessonStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Scans entries for extractable patterns and stores the resulting
    /// lessons. Extraction is best-effort: a storage failure is logged, not
    /// propagated, because the workflow outcome is already decided.
    pub async fn extract_from_run(
        &self,
        project_id: &str,
        bead_id: &str,
        entries: &[ActionEntry],
        terminal_reason: &str,
    ) {
        if entries.is_empty() && terminal_reason.is_empty() {
            return;
        }

        let mut mined = Vec::new();
        mined.extend(Self::build_patterns(entries));
        mined.extend(Self::test_patterns(entries));
        mined.extend(Self::edit_patterns(entries));
        if let Some(insight) = Self::terminal_insight(terminal_reason, entries.len()) {
            mined.push(insight);
        }

        for m in mined {
            let lesson = Lesson::new(project_id, m.category, m.title, m.detail)
                .with_source(bead_id, "");
            self.store_lesson(lesson).await;
        }
    }

    async fn store_lesson(&self, lesson: Lesson) {
        let title = lesson.title.clone();
        let text = lesson.embedding_text();

        let embedding = match self.embedder.embed(&[text]).await {
            Ok(mut embeddings) if embeddings.first().is_some_and(|e| !e.is_empty()) => {
                Some(embeddings.remove(0))
            }
            _ => None,
        };

        match embedding {
            Some(embedding) => {
                match self.store.store_lesson_with_embedding(lesson, embedding).await {
                    Ok(()) => info!(title = %title, "Extracted lesson"),
                    Err(e) => warn!(error = %e, "Failed to store lesson with embedding"),
                }
            }
            None => match self.store.create_lesson(lesson).await {
                Ok(()) => info!(title = %title, "Extracted lesson (no embedding)"),
                Err(e) => warn!(error = %e, "Failed to store lesson"),
            },
        }
    }

    fn build_patterns(entries: &[ActionEntry]) -> Option<MinedLesson> {
        let failures: Vec<&str> = entries
            .iter()
            .filter(|e| e.action_type == "build_project" && e.is_error())
            .map(|e| truncate(&e.message, 200))
            .collect();
        if failures.len() < 2 {
            return None;
        }
        Some(MinedLesson {
            category: LessonCategory::BuildFailure,
            title: format!("Repeated build failures ({} times)", failures.len()),
            detail: format!(
                "Build failed multiple times: {}",
                failures[..failures.len().min(3)].join("; ")
            ),
        })
    }

    fn test_patterns(entries: &[ActionEntry]) -> Option<MinedLesson> {
        let failures: Vec<&str> = entries
            .iter()
            .filter(|e| e.action_type == "run_tests" && e.is_error())
            .map(|e| truncate(&e.message, 200))
            .collect();
        if failures.len() < 2 {
            return None;
        }
        Some(MinedLesson {
            category: LessonCategory::TestFailure,
            title: format!("Repeated test failures ({} times)", failures.len()),
            detail: format!(
                "Tests failed multiple times: {}",
                failures[..failures.len().min(3)].join("; ")
            ),
        })
    }

    fn edit_patterns(entries: &[ActionEntry]) -> Vec<MinedLesson> {
        let mut path_failures: BTreeMap<&str, usize> = BTreeMap::new();
        for entry in entries {
            if matches!(entry.action_type.as_str(), "edit_file" | "apply_patch")
                && entry.is_error()
                && !entry.path.is_empty()
            {
                *path_failures.entry(entry.path.as_str()).or_insert(0) += 1;
            }
        }

        path_failures
            .into_iter()
            .filter(|(_, count)| *count >= 2)
            .map(|(path, count)| MinedLesson {
                category: LessonCategory::EditFailure,
                title: format!("Repeated edit failures on {}", path),
                detail: format!(
                    "File {} had {} edit failures and may need a different approach",
                    path, count
                ),
            })
            .collect()
    }

    fn terminal_insight(reason: &str, total_actions: usize) -> Option<MinedLesson> {
        let (title, detail) = match reason {
            "max_iterations" => (
                "Task hit max iterations".to_string(),
                format!(
                    "Task exhausted all iterations with {} total actions and may be too large for a single bead",
                    total_actions
                ),
            ),
            "inner_loop" | "loop" => (
                "Agent stuck in action loop".to_string(),
                "Agent repeated the same actions and needs clearer guidance or a different approach"
                    .to_string(),
            ),
            "parse_failures" => (
                "Agent produced unparseable responses".to_string(),
                "Agent failed to produce valid JSON actions and may need a simpler prompt or a different model"
                    .to_string(),
            ),
            _ => return None,
        };
        Some(MinedLesson {
            category: LessonCategory::ConversationInsight,
            title,
            detail,
        })
    }
}

fn truncate(s: &str, max_len: usize) -> &str {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
