use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::embedder::cosine_similarity;
use crate::error::{ArbiterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonCategory {
    BuildFailure,
    TestFailure,
    EditFailure,
    ConversationInsight,
}

impl LessonCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildFailure => "build_failure",
            Self::TestFailure => "test_failure",
            Self::EditFailure => "edit_failure",
            Self::ConversationInsight => "conversation_insight",
        }
    }
}

impl std::fmt::Display for LessonCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A short note mined from past bead transcripts, retrievable by similarity
/// so future prompts avoid repeating the same mistakes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    pub project_id: String,
    pub category: LessonCategory,
    pub title: String,
    pub detail: String,
    #[serde(default)]
    pub source_bead_id: String,
    #[serde(default)]
    pub source_agent_id: String,
    pub created_at: DateTime<Utc>,
    pub relevance_score: f32,
}

impl Lesson {
    pub fn new(
        project_id: impl Into<String>,
        category: LessonCategory,
        title: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            category,
            title: title.into(),
            detail: detail.into(),
            source_bead_id: String::new(),
            source_agent_id: String::new(),
            created_at: Utc::now(),
            relevance_score: 1.0,
        }
    }

    pub fn with_source(mut self, bead_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        self.source_bead_id = bead_id.into();
        self.source_agent_id = agent_id.into();
        self
    }

    /// Text fed to the embedder when the lesson is stored.
    pub fn embedding_text(&self) -> String {
        format!("{} {}", self.title, self.detail)
    }
}

/// Persistence seam for lessons. SQL and key-value backends adapt this trait;
/// the in-memory implementation below backs tests and single-process runs.
#[async_trait]
pub trait LessonStore: Send + Sync {
    async fn create_lesson(&self, lesson: Lesson) -> Result<()>;

    async fn store_lesson_with_embedding(&self, lesson: Lesson, embedding: Vec<f32>) -> Result<()>;

    /// Most-recent lessons for a project, bounded by count and by total
    /// formatted characters.
    async fn lessons_for_project(
        &self,
        project_id: &str,
        limit: usize,
        char_budget: usize,
    ) -> Result<Vec<Lesson>>;

    /// Top-K lessons by cosine similarity against the query vector. Lessons
    /// without an embedding are skipped.
    async fn search_by_similarity(
        &self,
        project_id: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(Lesson, f32)>>;
}

#[derive(Default)]
pub struct MemoryLessonStore {
    lessons: RwLock<Vec<(Lesson, Option<Vec<f32>>)>>,
}

impl MemoryLessonStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lessons.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lessons.read().is_empty()
    }
}

#[async_trait]
impl LessonStore for MemoryLessonStore {
    async fn create_lesson(&self, lesson: Lesson) -> Result<()> {
        self.lessons.write().push((lesson, None));
        Ok(())
    }

    async fn store_lesson_with_embedding(&self, lesson: Lesson, embedding: Vec<f32>) -> Result<()> {
        if embedding.is_empty() {
            return Err(ArbiterError::LessonStore(
                "refusing to store empty embedding".to_string(),
            ));
        }
        self.lessons.write().push((lesson, Some(embedding)));
        Ok(())
    }

    async fn lessons_for_project(
        &self,
        project_id: &str,
        limit: usize,
        char_budget: usize,
    ) -> Result<Vec<Lesson>> {
        let guard = self.lessons.read();
        let mut matched: Vec<Lesson> = guard
            .iter()
            .filter(|(l, _)| l.project_id == project_id)
            .map(|(l, _)| l.clone())
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched.truncate(limit);

        let mut total = 0usize;
        matched.retain(|l| {
            total += l.title.len() + l.detail.len();
            total <= char_budget
        });
        Ok(matched)
    }

    async fn search_by_similarity(
        &self,
        project_id: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(Lesson, f32)>> {
        let guard = self.lessons.read();
        let mut scored: Vec<(Lesson, f32)> = guard
            .iter()
            .filter(|(l, _)| l.project_id == project_id)
            .filter_map(|(l, emb)| {
                emb.as_ref()
                    .map(|e| (l.clone(), cosine_similarity(query, e)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}
