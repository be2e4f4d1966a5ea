//! Embedding persistence and cosine similarity search.
//!
//! Vectors are stored as little-endian f32 blobs keyed by
//! (target_type, target_id, model_id). Search embeds the query through the
//! configured `Embedder` and scans task-scoped candidates in memory.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Serialize)]
pub struct VectorHit {
    pub id: String,
    pub text: String,
    pub similarity: f64,
}

pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_embedding(
        &self,
        target_type: &str,
        target_id: &str,
        model_id: &str,
        vector: &[f32],
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO embeddings (target_type, target_id, model_id, vector, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(target_type, target_id, model_id) DO UPDATE SET
                 vector = excluded.vector,
                 created_at = excluded.created_at",
        )
        .bind(target_type)
        .bind(target_id)
        .bind(model_id)
        .bind(encode_vector(vector))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to upsert embedding")?;
        Ok(())
    }

    /// Candidate (id, text, vector) rows for a target type, optionally
    /// scoped to a task.
    async fn candidates(
        &self,
        target_type: &str,
        model_id: &str,
        task_id: Option<&str>,
    ) -> Result<Vec<(String, String, Vec<f32>)>> {
        let rows = match (target_type, task_id) {
            ("claim", Some(task)) => {
                sqlx::query(
                    "SELECT e.target_id AS id, c.claim_text AS text, e.vector AS vector
                     FROM embeddings e
                     JOIN claims c ON c.id = e.target_id
                     WHERE e.target_type = 'claim' AND e.model_id = ? AND c.task_id = ?",
                )
                .bind(model_id)
                .bind(task)
                .fetch_all(&self.pool)
                .await
            }
            ("claim", None) => {
                sqlx::query(
                    "SELECT e.target_id AS id, c.claim_text AS text, e.vector AS vector
                     FROM embeddings e
                     JOIN claims c ON c.id = e.target_id
                     WHERE e.target_type = 'claim' AND e.model_id = ?",
                )
                .bind(model_id)
                .fetch_all(&self.pool)
                .await
            }
            ("fragment", Some(task)) => {
                sqlx::query(
                    "SELECT DISTINCT e.target_id AS id, f.text_content AS text, e.vector AS vector
                     FROM embeddings e
                     JOIN fragments f ON f.id = e.target_id
                     JOIN pages p ON p.id = f.page_id
                     JOIN serp_items s ON s.url = p.url
                     JOIN queries q ON q.id = s.query_id
                     WHERE e.target_type = 'fragment' AND e.model_id = ? AND q.task_id = ?",
                )
                .bind(model_id)
                .bind(task)
                .fetch_all(&self.pool)
                .await
            }
            _ => {
                sqlx::query(
                    "SELECT e.target_id AS id, f.text_content AS text, e.vector AS vector
                     FROM embeddings e
                     JOIN fragments f ON f.id = e.target_id
                     WHERE e.target_type = 'fragment' AND e.model_id = ?",
                )
                .bind(model_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to fetch embedding candidates")?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("id"),
                    row.get::<String, _>("text"),
                    decode_vector(&row.get::<Vec<u8>, _>("vector")),
                )
            })
            .collect())
    }

    /// Top-k cosine search. Returns hits and the candidate count searched.
    pub async fn search(
        &self,
        query_vector: &[f32],
        target_type: &str,
        model_id: &str,
        task_id: Option<&str>,
        top_k: usize,
        min_similarity: f64,
    ) -> Result<(Vec<VectorHit>, usize)> {
        let candidates = self.candidates(target_type, model_id, task_id).await?;
        let total_searched = candidates.len();

        let mut hits: Vec<VectorHit> = candidates
            .into_iter()
            .filter_map(|(id, text, vector)| {
                let similarity = cosine_similarity(query_vector, &vector);
                (similarity >= min_similarity).then_some(VectorHit {
                    id,
                    text,
                    similarity,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);

        Ok((hits, total_searched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_codec_round_trips() {
        let v = vec![0.5f32, -1.25, 3.0];
        assert_eq!(decode_vector(&encode_vector(&v)), v);
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn search_ranks_by_similarity_and_respects_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let store = VectorStore::new(pool.clone());

        // Claims need a task to satisfy the FK.
        sqlx::query("INSERT INTO tasks (id, hypothesis, status, created_at) VALUES ('t_1', 'h', 'exploring', ?)")
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&pool)
            .await
            .unwrap();
        for (id, text) in [("cl_a", "close match"), ("cl_b", "orthogonal"), ("cl_c", "opposite")] {
            sqlx::query(
                "INSERT INTO claims (id, task_id, claim_text, created_at) VALUES (?, 't_1', ?, ?)",
            )
            .bind(id)
            .bind(text)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&pool)
            .await
            .unwrap();
        }

        store.upsert_embedding("claim", "cl_a", "test-model", &[1.0, 0.1]).await.unwrap();
        store.upsert_embedding("claim", "cl_b", "test-model", &[0.0, 1.0]).await.unwrap();
        store.upsert_embedding("claim", "cl_c", "test-model", &[-1.0, 0.0]).await.unwrap();

        let (hits, searched) = store
            .search(&[1.0, 0.0], "claim", "test-model", Some("t_1"), 10, 0.5)
            .await
            .unwrap();

        assert_eq!(searched, 3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "cl_a");

        // Task scoping excludes other tasks entirely.
        let (hits, searched) = store
            .search(&[1.0, 0.0], "claim", "test-model", Some("t_other"), 10, 0.0)
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(searched, 0);
    }
}
