//! Lesson extraction feeding back into prompt injection.

use std::sync::Arc;

use arbiter::dispatch::LessonsProvider;
use arbiter::memory::{
    cosine_similarity, decode_embedding, encode_embedding, ActionEntry, Embedder, FallbackEmbedder,
    HashEmbedder, LessonExtractor, MemoryLessonStore,
};

fn entry(action_type: &str, status: &str, message: &str, path: &str) -> ActionEntry {
    ActionEntry {
        iteration: 0,
        action_type: action_type.to_string(),
        status: status.to_string(),
        message: message.to_string(),
        path: path.to_string(),
    }
}

#[tokio::test]
async fn test_extracted_lessons_condition_future_prompts() {
    let store = Arc::new(MemoryLessonStore::new());
    let embedder = Arc::new(HashEmbedder::new());
    let extractor = LessonExtractor::new(store.clone(), embedder.clone());

    // A failed run with repeated test failures in the payment module
    let transcript = vec![
        entry("read_file", "ok", "", "src/payments.rs"),
        entry("run_tests", "error", "payment refund test failed", ""),
        entry("edit_file", "ok", "", "src/payments.rs"),
        entry("run_tests", "error", "payment refund test failed again", ""),
    ];
    extractor
        .extract_from_run("shop", "bead-1", &transcript, "")
        .await;
    assert_eq!(store.len(), 1);

    // A later bead about the same area retrieves the lesson
    let provider = LessonsProvider::new(store.clone(), embedder.clone());
    let block = provider
        .relevant_lessons("shop", "fix failing payment refund tests", 5)
        .await;
    assert!(block.contains("Repeated test failures"), "got: {}", block);
    assert!(block.contains("TEST_FAILURE"));

    // An unrelated project sees nothing
    let other = provider
        .relevant_lessons("website", "fix failing payment refund tests", 5)
        .await;
    assert!(other.is_empty());
}

#[tokio::test]
async fn test_terminal_loop_reason_becomes_standing_lesson() {
    let store = Arc::new(MemoryLessonStore::new());
    let embedder = Arc::new(HashEmbedder::new());
    let extractor = LessonExtractor::new(store.clone(), embedder.clone());

    extractor
        .extract_from_run("shop", "bead-2", &[], "parse_failures")
        .await;

    let provider = LessonsProvider::new(store, embedder);
    let block = provider.recent_lessons("shop").await;
    assert!(block.contains("unparseable responses"), "got: {}", block);
}

#[tokio::test]
async fn test_embeddings_survive_blob_storage() {
    let embedder = HashEmbedder::new();
    let vectors = embedder
        .embed(&[
            "repeated build failures in the worker crate".to_string(),
            "flaky integration test on CI".to_string(),
        ])
        .await
        .unwrap();

    for vec in &vectors {
        let decoded = decode_embedding(&encode_embedding(vec));
        assert_eq!(&decoded, vec);
        // Round-tripping preserves similarity exactly
        let sim = cosine_similarity(vec, &decoded);
        assert!((sim - 1.0).abs() < 1e-3);
    }
}

#[tokio::test]
async fn test_fallback_embedder_degrades_to_hashing() {
    struct AlwaysFails;

    #[async_trait::async_trait]
    impl Embedder for AlwaysFails {
        async fn embed(&self, _texts: &[String]) -> arbiter::Result<Vec<Vec<f32>>> {
            Err(arbiter::ArbiterError::Embedding("endpoint down".into()))
        }
    }

    let fallback = FallbackEmbedder::new(Some(Box::new(AlwaysFails)));
    let result = fallback
        .embed(&["still produces a vector".to_string()])
        .await
        .unwrap();
    assert_eq!(result.len(), 1);
    assert!(result[0].iter().any(|&v| v != 0.0));
}
