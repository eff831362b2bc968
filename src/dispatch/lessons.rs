use std::sync::Arc;

use tracing::warn;

use crate::memory::{Embedder, Lesson, LessonCategory, LessonStore};

/// Formatted lesson block may not exceed this many characters when injected
/// into a system prompt.
const PROMPT_CHAR_BUDGET: usize = 2000;

const RECENCY_LIMIT: usize = 15;
const RECENCY_CHAR_BUDGET: usize = 4000;
const DEFAULT_TOP_K: usize = 5;

/// Bridges the dispatcher to the lesson store: fetches the lessons most
/// relevant to a task and formats them for system-prompt injection.
pub struct LessonsProvider {
    store: Arc<dyn LessonStore>,
    embedder: Arc<dyn Embedder>,
}

impl LessonsProvider {
    pub fn new(store: Arc<dyn LessonStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Top-K lessons by semantic similarity to the task context, rendered as
    /// a markdown block. Falls back to recency ordering when the context is
    /// empty or embedding fails; returns an empty string when there is
    /// nothing worth injecting.
    pub async fn relevant_lessons(&self, project_id: &str, task_context: &str, top_k: usize) -> String {
        if project_id.is_empty() {
            return String::new();
        }
        if task_context.is_empty() {
            return self.recent_lessons(project_id).await;
        }

        let top_k = if top_k == 0 { DEFAULT_TOP_K } else { top_k };

        let query = match self.embedder.embed(&[task_context.to_string()]).await {
            Ok(mut embeddings) if !embeddings.is_empty() && !embeddings[0].is_empty() => {
                embeddings.remove(0)
            }
            Ok(_) => return self.recent_lessons(project_id).await,
            Err(e) => {
                warn!(error = %e, "Embedding failed, falling back to recency");
                return self.recent_lessons(project_id).await;
            }
        };

        let scored = match self.store.search_by_similarity(project_id, &query, top_k).await {
            Ok(scored) => scored,
            Err(e) => {
                warn!(error = %e, "Similarity search failed, falling back to recency");
                return self.recent_lessons(project_id).await;
            }
        };

        if scored.is_empty() {
            return String::new();
        }

        let mut block = String::from(
            "The following lessons are relevant to this task.\nApply them where appropriate:\n\n",
        );
        let mut total = 0usize;
        for (lesson, _) in scored {
            let entry = format_lesson(&lesson);
            total += entry.len();
            if total > PROMPT_CHAR_BUDGET {
                break;
            }
            block.push_str(&entry);
        }
        block
    }

    /// Most-recent lessons for the project, used when similarity search is
    /// unavailable.
    pub async fn recent_lessons(&self, project_id: &str) -> String {
        let lessons = match self
            .store
            .lessons_for_project(project_id, RECENCY_LIMIT, RECENCY_CHAR_BUDGET)
            .await
        {
            Ok(lessons) => lessons,
            Err(e) => {
                warn!(error = %e, project = project_id, "Failed to fetch lessons");
                return String::new();
            }
        };

        if lessons.is_empty() {
            return String::new();
        }

        let mut block = String::from(
            "The following lessons were learned from previous work on this project.\nAvoid repeating these mistakes:\n\n",
        );
        for lesson in &lessons {
            block.push_str(&format_lesson(lesson));
            if lesson.relevance_score < 0.3 {
                block.push_str("- (older lesson, may be less relevant)\n");
            }
        }
        block
    }

    /// Records a lesson observed directly by the dispatcher, embedding it for
    /// future semantic search.
    pub async fn record_lesson(
        &self,
        project_id: &str,
        category: LessonCategory,
        title: &str,
        detail: &str,
        bead_id: &str,
        agent_id: &str,
    ) {
        let lesson =
            Lesson::new(project_id, category, title, detail).with_source(bead_id, agent_id);
        let text = lesson.embedding_text();

        let embedding = match self.embedder.embed(&[text]).await {
            Ok(mut embeddings) if embeddings.first().is_some_and(|e| !e.is_empty()) => {
                Some(embeddings.remove(0))
            }
            _ => None,
        };

        match embedding {
            Some(embedding) => {
                if let Err(e) = self.store.store_lesson_with_embedding(lesson, embedding).await {
                    warn!(error = %e, "Failed to record lesson with embedding");
                }
            }
            None => {
                if let Err(e) = self.store.create_lesson(lesson).await {
                    warn!(error = %e, "Failed to record lesson");
                }
            }
        }
    }
}

fn format_lesson(lesson: &Lesson) -> String {
    format!(
        "### {}: {}\n- {}\n\n",
        lesson.category.as_str().to_uppercase(),
        lesson.title,
        lesson.detail
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HashEmbedder, MemoryLessonStore};

    fn provider(store: Arc<MemoryLessonStore>) -> LessonsProvider {
        LessonsProvider::new(store, Arc::new(HashEmbedder::new()))
    }

    #[tokio::test]
    async fn test_empty_project_yields_empty_block() {
        let provider = provider(Arc::new(MemoryLessonStore::new()));
        assert!(provider.relevant_lessons("proj", "fix tests", 5).await.is_empty());
        assert!(provider.relevant_lessons("", "fix tests", 5).await.is_empty());
    }

    #[tokio::test]
    async fn test_relevant_lessons_formats_markdown() {
        let store = Arc::new(MemoryLessonStore::new());
        let provider = provider(store);
        provider
            .record_lesson(
                "proj",
                LessonCategory::TestFailure,
                "Repeated test failures",
                "Integration tests flaky on CI runners",
                "bead-1",
                "agent-1",
            )
            .await;

        let block = provider
            .relevant_lessons("proj", "tests failing on CI", 5)
            .await;
        assert!(block.contains("### TEST_FAILURE: Repeated test failures"));
        assert!(block.len() <= PROMPT_CHAR_BUDGET + 200);
    }

    #[tokio::test]
    async fn test_block_respects_char_budget() {
        let store = Arc::new(MemoryLessonStore::new());
        let provider = provider(store);
        for i in 0..10 {
            provider
                .record_lesson(
                    "proj",
                    LessonCategory::EditFailure,
                    &format!("Edit failures on module {}", i),
                    &"x".repeat(400),
                    "bead-1",
                    "agent-1",
                )
                .await;
        }

        let block = provider.relevant_lessons("proj", "edit module code", 10).await;
        assert!(block.len() <= PROMPT_CHAR_BUDGET + 200, "len={}", block.len());
    }

    #[tokio::test]
    async fn test_empty_context_uses_recency() {
        let store = Arc::new(MemoryLessonStore::new());
        let provider = provider(store);
        provider
            .record_lesson(
                "proj",
                LessonCategory::BuildFailure,
                "Repeated build failures",
                "Linker errors",
                "bead-1",
                "agent-1",
            )
            .await;

        let block = provider.relevant_lessons("proj", "", 5).await;
        assert!(block.contains("previous work on this project"));
    }
}
