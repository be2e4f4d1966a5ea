//! Evidence edges.
//!
//! The graph is an adjacency table keyed by (source_type, source_id,
//! target_type, target_id, relation); cycles across page/fragment/claim are
//! allowed, traversal uses explicit visited sets on the caller side.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use super::parse_datetime;
use crate::domain::{Edge, EdgeRelation, NodeType};

pub struct EdgeRepository {
    pool: SqlitePool,
}

impl EdgeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert an edge. Both endpoints must exist; self-loops are rejected.
    /// Re-inserting the same (source, target, relation) updates confidence.
    pub async fn insert(
        &self,
        source_type: NodeType,
        source_id: &str,
        target_type: NodeType,
        target_id: &str,
        relation: EdgeRelation,
        confidence: f64,
    ) -> Result<String> {
        if source_type == target_type && source_id == target_id {
            anyhow::bail!("self-loop edge rejected: {}:{}", source_type.as_str(), source_id);
        }

        self.assert_endpoint_exists(source_type, source_id).await?;
        self.assert_endpoint_exists(target_type, target_id).await?;

        let id = format!("e_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        sqlx::query(
            "INSERT INTO edges (id, source_type, source_id, target_type, target_id,
                                relation, confidence, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(source_type, source_id, target_type, target_id, relation)
             DO UPDATE SET confidence = excluded.confidence",
        )
        .bind(&id)
        .bind(source_type.as_str())
        .bind(source_id)
        .bind(target_type.as_str())
        .bind(target_id)
        .bind(relation.as_str())
        .bind(confidence.clamp(0.0, 1.0))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to insert edge")?;

        Ok(id)
    }

    async fn assert_endpoint_exists(&self, node_type: NodeType, id: &str) -> Result<()> {
        let table = match node_type {
            NodeType::Page => "pages",
            NodeType::Fragment => "fragments",
            NodeType::Claim => "claims",
        };
        let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
        let found = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to check edge endpoint")?;

        if found.is_none() {
            anyhow::bail!("edge endpoint missing: {}:{}", node_type.as_str(), id);
        }
        Ok(())
    }

    pub async fn get_by_id(&self, edge_id: &str) -> Result<Option<Edge>> {
        let row = sqlx::query(
            "SELECT id, source_type, source_id, target_type, target_id,
                    relation, confidence, created_at
             FROM edges WHERE id = ?",
        )
        .bind(edge_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch edge")?;

        row.map(|r| row_to_edge(&r)).transpose()
    }

    /// Edges touching the claims of a task.
    pub async fn for_task_claims(&self, task_id: &str) -> Result<Vec<Edge>> {
        let rows = sqlx::query(
            "SELECT e.id, e.source_type, e.source_id, e.target_type, e.target_id,
                    e.relation, e.confidence, e.created_at
             FROM edges e
             JOIN claims c ON (e.target_type = 'claim' AND e.target_id = c.id)
                           OR (e.source_type = 'claim' AND e.source_id = c.id)
             WHERE c.task_id = ?",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch task edges")?;

        rows.iter().map(row_to_edge).collect()
    }

    /// True if the fragment/claim pair already has a supports or refutes edge.
    pub async fn has_judgment(&self, fragment_id: &str, claim_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM edges
             WHERE source_type = 'fragment' AND source_id = ?
               AND target_type = 'claim' AND target_id = ?
               AND relation IN ('supports', 'refutes')",
        )
        .bind(fragment_id)
        .bind(claim_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check judgment edge")?;
        Ok(row.is_some())
    }

    pub async fn update(
        &self,
        edge_id: &str,
        relation: Option<EdgeRelation>,
        confidence: Option<f64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE edges SET
                 relation = COALESCE(?, relation),
                 confidence = COALESCE(?, confidence)
             WHERE id = ?",
        )
        .bind(relation.map(|r| r.as_str()))
        .bind(confidence.map(|c| c.clamp(0.0, 1.0)))
        .bind(edge_id)
        .execute(&self.pool)
        .await
        .context("Failed to update edge")?;

        Ok(result.rows_affected() == 1)
    }
}

fn row_to_edge(row: &sqlx::sqlite::SqliteRow) -> Result<Edge> {
    Ok(Edge {
        id: row.get("id"),
        source_type: NodeType::from_str(row.get::<&str, _>("source_type"))
            .map_err(|_| anyhow::anyhow!("unknown node type in edge row"))?,
        source_id: row.get("source_id"),
        target_type: NodeType::from_str(row.get::<&str, _>("target_type"))
            .map_err(|_| anyhow::anyhow!("unknown node type in edge row"))?,
        target_id: row.get("target_id"),
        relation: EdgeRelation::from_str(row.get::<&str, _>("relation"))
            .map_err(|_| anyhow::anyhow!("unknown relation in edge row"))?,
        confidence: row.get("confidence"),
        created_at: parse_datetime(row.get("created_at")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClaimGranularity, ClaimPolarity, ClaimType};
    use crate::repository::{ClaimRepository, PageRepository, TaskRepository};

    async fn seeded(pool: &sqlx::SqlitePool) -> (String, String) {
        let task_id = TaskRepository::new(pool.clone())
            .create("edge invariants")
            .await
            .unwrap();
        let claim_id = ClaimRepository::new(pool.clone())
            .insert(
                &task_id,
                "claim",
                ClaimType::Factual,
                ClaimPolarity::Positive,
                ClaimGranularity::Atomic,
                None,
                "edge invariants",
                &[],
                &[],
                1.0,
            )
            .await
            .unwrap();

        let pages = PageRepository::new(pool.clone());
        let url = url::Url::parse("https://example.com/evidence").unwrap();
        let page_id = pages.upsert(&url, None, None, None).await.unwrap();
        let fragment_id = pages
            .insert_fragment(&page_id, "a fragment of evidence", None, 0.8, true)
            .await
            .unwrap();

        (claim_id, fragment_id)
    }

    #[tokio::test]
    async fn insert_requires_existing_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let edges = EdgeRepository::new(pool.clone());
        let (claim_id, fragment_id) = seeded(&pool).await;

        let edge_id = edges
            .insert(
                NodeType::Fragment,
                &fragment_id,
                NodeType::Claim,
                &claim_id,
                EdgeRelation::Supports,
                0.8,
            )
            .await
            .unwrap();

        let edge = edges.get_by_id(&edge_id).await.unwrap().unwrap();
        assert_eq!(edge.relation, EdgeRelation::Supports);
        assert!((edge.confidence - 0.8).abs() < f64::EPSILON);

        // Missing endpoint is rejected.
        let err = edges
            .insert(
                NodeType::Fragment,
                "f_missing",
                NodeType::Claim,
                &claim_id,
                EdgeRelation::Supports,
                0.5,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("endpoint missing"));
    }

    #[tokio::test]
    async fn self_loops_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let edges = EdgeRepository::new(pool.clone());
        let (claim_id, _) = seeded(&pool).await;

        let err = edges
            .insert(
                NodeType::Claim,
                &claim_id,
                NodeType::Claim,
                &claim_id,
                EdgeRelation::Cites,
                1.0,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("self-loop"));
    }

    #[tokio::test]
    async fn update_corrects_relation_and_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let edges = EdgeRepository::new(pool.clone());
        let (claim_id, fragment_id) = seeded(&pool).await;

        let edge_id = edges
            .insert(
                NodeType::Fragment,
                &fragment_id,
                NodeType::Claim,
                &claim_id,
                EdgeRelation::Supports,
                0.9,
            )
            .await
            .unwrap();

        assert!(edges
            .update(&edge_id, Some(EdgeRelation::Refutes), Some(0.4))
            .await
            .unwrap());
        let edge = edges.get_by_id(&edge_id).await.unwrap().unwrap();
        assert_eq!(edge.relation, EdgeRelation::Refutes);
        assert!((edge.confidence - 0.4).abs() < f64::EPSILON);

        assert!(!edges.update("e_missing", None, Some(0.5)).await.unwrap());
    }
}
