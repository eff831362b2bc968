pub mod embedder;
pub mod extractor;
pub mod lesson;

pub use embedder::{
    cosine_similarity, decode_embedding, encode_embedding, Embedder, FallbackEmbedder,
    HashEmbedder, ProviderEmbedder, HASH_DIMENSIONS,
};
pub use extractor::{ActionEntry, LessonExtractor};
pub use lesson::{Lesson, LessonCategory, LessonStore, MemoryLessonStore};
