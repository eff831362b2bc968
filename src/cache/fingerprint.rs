use sha2::{Digest, Sha256};

use crate::provider::ChatRequest;

/// Deterministic cache key for a chat request.
///
/// Covers every field that changes the semantics of the response: model,
/// message sequence (whitespace-collapsed), sampling parameters, stop
/// sequences, and the tool schema. Request ids, user ids, and timestamps are
/// deliberately absent so retries and replays hit the same entry.
pub fn request_fingerprint(request: &ChatRequest) -> String {
    let mut hasher = Sha256::new();

    hasher.update(request.model.as_bytes());
    hasher.update([0]);

    for message in &request.messages {
        hasher.update(message.role.as_bytes());
        hasher.update([1]);
        hasher.update(collapse_whitespace(&message.content).as_bytes());
        hasher.update([0]);
    }

    if let Some(temperature) = request.temperature {
        hasher.update(format!("{:.2}", temperature).as_bytes());
    }
    hasher.update([0]);

    if let Some(top_p) = request.top_p {
        hasher.update(format!("{:.2}", top_p).as_bytes());
    }
    hasher.update([0]);

    let mut stops = request.stop.clone();
    stops.sort();
    for stop in &stops {
        hasher.update(stop.as_bytes());
        hasher.update([1]);
    }
    hasher.update([0]);

    if let Some(tools) = &request.tools {
        let schema = serde_json::to_string(tools).unwrap_or_default();
        hasher.update(Sha256::digest(schema.as_bytes()));
    }

    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
