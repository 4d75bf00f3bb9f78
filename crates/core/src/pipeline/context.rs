//! Context-chunk selection for revision prompts.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{StoreError, poisoned};
use crate::types::{ChunkKind, ContextChunk};

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

/// Lexical overlap of `chunk` with the query tokens, damped by chunk length
/// so long chunks do not win on volume alone.
fn score(chunk: &HashSet<String>, query: &HashSet<String>) -> f64 {
    if chunk.is_empty() {
        return 0.0;
    }
    let shared = chunk.intersection(query).count() as f64;
    shared / (chunk.len() as f64).sqrt()
}

/// Query for ranking: the lead's latest message plus the current draft.
pub fn build_query(lead_message: &str, draft: &str) -> String {
    format!("{lead_message}\n{draft}")
}

/// Pick up to `limit` detail chunks by relevance to `query`.
///
/// Equal scores prefer chunks whose group is already represented, then input
/// order. Summary chunks of every represented group are appended after the
/// ranked chunks and do not count toward `limit`.
pub fn select_chunks(chunks: &[ContextChunk], query: &str, limit: usize) -> Vec<ContextChunk> {
    let query = tokens(query);
    let mut candidates: Vec<(usize, f64)> = chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| c.kind == ChunkKind::Detail)
        .map(|(i, c)| (i, score(&tokens(&c.text), &query)))
        .filter(|(_, s)| *s > 0.0)
        .collect();

    let mut selected: Vec<usize> = Vec::new();
    let mut groups: HashSet<&str> = HashSet::new();
    while selected.len() < limit && !candidates.is_empty() {
        let mut best = 0;
        for j in 1..candidates.len() {
            let (bi, bs) = candidates[best];
            let (ci, cs) = candidates[j];
            let better = cs > bs
                || (cs == bs
                    && groups.contains(chunks[ci].group.as_str())
                    && !groups.contains(chunks[bi].group.as_str()));
            if better {
                best = j;
            }
        }
        let (idx, _) = candidates.remove(best);
        groups.insert(chunks[idx].group.as_str());
        selected.push(idx);
    }

    let summaries = chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| c.kind == ChunkKind::Summary && groups.contains(c.group.as_str()))
        .map(|(i, _)| i);
    selected.extend(summaries);
    selected.into_iter().map(|i| chunks[i].clone()).collect()
}

/// Cache key for a ranked selection.
pub fn cache_key(scope: &str, query: &str, limit: usize) -> String {
    let digest = format!("{:x}", Sha256::digest(query.as_bytes()));
    format!("chunks:{scope}:{limit}:{}", &digest[..16])
}

/// Cache for ranked chunk selections.
#[async_trait]
pub trait ChunkCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<ContextChunk>>, StoreError>;

    async fn put(&self, key: &str, chunks: &[ContextChunk]) -> Result<(), StoreError>;
}

/// Unbounded process-local cache.
#[derive(Debug, Default)]
pub struct InMemoryChunkCache {
    entries: Mutex<HashMap<String, Vec<ContextChunk>>>,
}

impl InMemoryChunkCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkCache for InMemoryChunkCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<ContextChunk>>, StoreError> {
        Ok(self.entries.lock().map_err(poisoned)?.get(key).cloned())
    }

    async fn put(&self, key: &str, chunks: &[ContextChunk]) -> Result<(), StoreError> {
        self.entries.lock().map_err(poisoned)?.insert(key.to_owned(), chunks.to_vec());
        Ok(())
    }
}

/// Cache that never hits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoChunkCache;

#[async_trait]
impl ChunkCache for NoChunkCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<ContextChunk>>, StoreError> {
        Ok(None)
    }

    async fn put(&self, _key: &str, _chunks: &[ContextChunk]) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, group: &str, kind: ChunkKind, text: &str) -> ContextChunk {
        ContextChunk { id: id.into(), group: group.into(), kind, text: text.into() }
    }

    fn ids(chunks: &[ContextChunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn ranks_by_overlap_and_respects_limit() {
        let chunks = vec![
            chunk("a", "g1", ChunkKind::Detail, "pricing starts at the growth plan"),
            chunk("b", "g2", ChunkKind::Detail, "weather report tuesday"),
            chunk("c", "g3", ChunkKind::Detail, "growth plan pricing includes onboarding pricing"),
        ];
        let picked = select_chunks(&chunks, "what is the pricing for the growth plan", 1);
        assert_eq!(ids(&picked), vec!["a"]);
        let picked = select_chunks(&chunks, "what is the pricing for the growth plan", 5);
        assert_eq!(ids(&picked), vec!["a", "c"]);
    }

    #[test]
    fn ties_prefer_represented_groups() {
        let chunks = vec![
            chunk("x1", "other", ChunkKind::Detail, "demo call"),
            chunk("t1", "thread", ChunkKind::Detail, "demo call link"),
            chunk("t2", "thread", ChunkKind::Detail, "demo call"),
        ];
        // t1 wins outright, then x1 and t2 tie; t2 shares t1's group.
        let picked = select_chunks(&chunks, "book a demo call link", 2);
        assert_eq!(ids(&picked), vec!["t1", "t2"]);
    }

    #[test]
    fn summaries_follow_their_group() {
        let chunks = vec![
            chunk("s1", "thread", ChunkKind::Summary, "lead asked about pricing twice"),
            chunk("s2", "kb", ChunkKind::Summary, "security faq"),
            chunk("d1", "thread", ChunkKind::Detail, "can you send pricing"),
            chunk("d2", "kb", ChunkKind::Detail, "soc2 report available"),
        ];
        let picked = select_chunks(&chunks, "pricing please", 1);
        assert_eq!(ids(&picked), vec!["d1", "s1"]);
    }

    #[test]
    fn no_overlap_selects_nothing() {
        let chunks = vec![chunk("a", "g", ChunkKind::Detail, "unrelated words")];
        assert!(select_chunks(&chunks, "pricing", 3).is_empty());
    }

    #[tokio::test]
    async fn cache_roundtrip() {
        let cache = InMemoryChunkCache::new();
        let key = cache_key("m1", "q", 6);
        assert!(cache.get(&key).await.unwrap().is_none());
        cache.put(&key, &[chunk("a", "g", ChunkKind::Detail, "t")]).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap().unwrap().len(), 1);
        assert_ne!(key, cache_key("m1", "q2", 6));
    }

    #[test]
    fn cache_key_is_scoped_and_short() {
        let key = cache_key("m1", "pricing for the growth plan", 6);
        let digest = key.strip_prefix("chunks:m1:6:").unwrap();
        assert_eq!(digest.len(), 16);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, cache_key("m1", "pricing for the growth plan", 6));
    }
}
