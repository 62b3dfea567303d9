//! SQLite-backed [`Store`] implementation.
//!
//! Segments are mirrored into the `segments_fts` FTS5 table inside the
//! same transaction that writes them, so the full-text index never lags
//! behind the segment table. Version numbering happens inside a write
//! transaction that takes the database lock before reading the current
//! maximum, which serializes concurrent appends to the same message. An
//! append that still loses to lock contention or to the
//! `UNIQUE(message_id, version_number)` constraint is retried in a fresh
//! transaction, up to three attempts.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sqlx::error::ErrorKind;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use groundwork_core::models::{
    Citation, Claim, ClaimStatus, Document, DocumentStatus, DocumentSummary, Message,
    MessageStatus, MessageSummary, NewVersion, Segment, Version, VersionSource,
};
use groundwork_core::store::{AppendRejected, Store};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    Ok(Document {
        id: row.get("id"),
        external_id: row.get("external_id"),
        title: row.get("title"),
        source: row.get("source"),
        body: row.get("body"),
        status: DocumentStatus::parse(&status)
            .ok_or_else(|| anyhow!("invalid document status '{}'", status))?,
        dedup_hash: row.get("dedup_hash"),
        created_at: row.get("created_at"),
    })
}

fn segment_from_row(row: &SqliteRow) -> Segment {
    Segment {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
    }
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let status: String = row.get("status");
    Ok(Message {
        id: row.get("id"),
        status: MessageStatus::parse(&status)
            .ok_or_else(|| anyhow!("invalid message status '{}'", status))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Push `(?, ?, ...)` binding every id.
fn push_id_list(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[String]) {
    builder.push("(");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");
}

const APPEND_ATTEMPTS: u32 = 3;

/// Lock contention, or a lost race for the next version number.
fn is_write_conflict(err: &anyhow::Error) -> bool {
    let Some(sqlx::Error::Database(db)) = err.downcast_ref::<sqlx::Error>() else {
        return false;
    };
    if db.kind() == ErrorKind::UniqueViolation {
        return true;
    }
    // SQLITE_BUSY and its extended codes share the low byte 5.
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| code & 0xff == 5)
}

const DOCUMENT_COLUMNS: &str =
    "id, external_id, title, source, body, status, dedup_hash, created_at";

impl SqliteStore {
    /// Write a version row plus its claims and citations on `tx`.
    async fn write_version(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        message_id: &str,
        version: &NewVersion,
        created_at: i64,
    ) -> Result<Version> {
        // The INSERT takes the write lock before MAX() is evaluated.
        let row = sqlx::query(
            r#"
            INSERT INTO message_versions
                (message_id, version_number, instruction, text, source, created_at)
            SELECT ?, COALESCE(MAX(version_number), 0) + 1, ?, ?, ?, ?
            FROM message_versions WHERE message_id = ?
            RETURNING id, version_number
            "#,
        )
        .bind(message_id)
        .bind(&version.instruction)
        .bind(&version.text)
        .bind(version.source.as_str())
        .bind(created_at)
        .bind(message_id)
        .fetch_one(&mut **tx)
        .await?;

        let version_id: i64 = row.get("id");
        let version_number: i64 = row.get("version_number");

        let all = version.claims.iter().chain(version.dropped_claims.iter());
        for (position, claim) in all.enumerate() {
            let claim_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO version_claims (version_id, position, text, status, reason)
                VALUES (?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(version_id)
            .bind(position as i64)
            .bind(&claim.text)
            .bind(claim.status.as_str())
            .bind(&claim.reason)
            .fetch_one(&mut **tx)
            .await?;

            for (cpos, citation) in claim.citations.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO claim_citations (claim_id, position, document_id, segment_id) VALUES (?, ?, ?, ?)",
                )
                .bind(claim_id)
                .bind(cpos as i64)
                .bind(&citation.document_id)
                .bind(&citation.segment_id)
                .execute(&mut **tx)
                .await?;
            }
        }

        Ok(Version {
            message_id: message_id.to_string(),
            version_number,
            instruction: version.instruction.clone(),
            text: version.text.clone(),
            claims: version.claims.clone(),
            dropped_claims: version.dropped_claims.clone(),
            source: version.source,
            created_at,
        })
    }

    /// One append attempt in its own transaction.
    ///
    /// The guarded UPDATE is the first statement, so it takes the write
    /// lock and re-reads the status before the version number is chosen.
    async fn try_append(
        &self,
        message_id: &str,
        version: &NewVersion,
        ts: i64,
    ) -> Result<Version> {
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query(
            "UPDATE messages SET updated_at = ? WHERE id = ? AND (NOT ? OR status = 'draft')",
        )
        .bind(ts)
        .bind(message_id)
        .bind(version.source.requires_draft())
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT COUNT(*) > 0 FROM messages WHERE id = ?")
                    .bind(message_id)
                    .fetch_one(&mut *tx)
                    .await?;
            let rejected = if exists {
                AppendRejected::Finalized(message_id.to_string())
            } else {
                AppendRejected::UnknownMessage(message_id.to_string())
            };
            return Err(rejected.into());
        }

        let stored = Self::write_version(&mut tx, message_id, version, ts).await?;
        tx.commit().await?;
        Ok(stored)
    }

    /// Rebuild a version from its row plus claim and citation rows.
    async fn hydrate_version(&self, row: &SqliteRow) -> Result<Version> {
        let version_id: i64 = row.get("id");
        let source: String = row.get("source");

        let claim_rows = sqlx::query(
            r#"
            SELECT c.id AS claim_id, c.text, c.status, c.reason,
                   cc.document_id, cc.segment_id
            FROM version_claims c
            LEFT JOIN claim_citations cc ON cc.claim_id = c.id
            WHERE c.version_id = ?
            ORDER BY c.position ASC, cc.position ASC
            "#,
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;

        let mut claims: Vec<(i64, Claim)> = Vec::new();
        for r in &claim_rows {
            let claim_id: i64 = r.get("claim_id");
            if claims.last().map(|(id, _)| *id) != Some(claim_id) {
                let status: String = r.get("status");
                claims.push((
                    claim_id,
                    Claim {
                        text: r.get("text"),
                        citations: Vec::new(),
                        status: ClaimStatus::parse(&status)
                            .ok_or_else(|| anyhow!("invalid claim status '{}'", status))?,
                        reason: r.get("reason"),
                    },
                ));
            }
            let document_id: Option<String> = r.get("document_id");
            let segment_id: Option<String> = r.get("segment_id");
            if let (Some(document_id), Some(segment_id), Some((_, claim))) =
                (document_id, segment_id, claims.last_mut())
            {
                claim.citations.push(Citation {
                    document_id,
                    segment_id,
                });
            }
        }

        let (supported, dropped): (Vec<Claim>, Vec<Claim>) = claims
            .into_iter()
            .map(|(_, c)| c)
            .partition(|c| c.status == ClaimStatus::Supported);

        Ok(Version {
            message_id: row.get("message_id"),
            version_number: row.get("version_number"),
            instruction: row.get("instruction"),
            text: row.get("text"),
            claims: supported,
            dropped_claims: dropped,
            source: VersionSource::parse(&source)
                .ok_or_else(|| anyhow!("invalid version source '{}'", source))?,
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_document(&self, doc: &Document, segments: &[Segment]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, external_id, title, source, body, status, dedup_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.external_id)
        .bind(&doc.title)
        .bind(&doc.source)
        .bind(&doc.body)
        .bind(doc.status.as_str())
        .bind(&doc.dedup_hash)
        .bind(doc.created_at)
        .execute(&mut *tx)
        .await?;

        for segment in segments {
            sqlx::query(
                "INSERT INTO segments (id, document_id, chunk_index, content) VALUES (?, ?, ?, ?)",
            )
            .bind(&segment.id)
            .bind(&segment.document_id)
            .bind(segment.chunk_index)
            .bind(&segment.content)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO segments_fts (segment_id, document_id, content) VALUES (?, ?, ?)",
            )
            .bind(&segment.id)
            .bind(&segment.document_id)
            .bind(&segment.content)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn find_document_by_external_id(&self, external_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE external_id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn find_document_by_hash(&self, dedup_hash: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE dedup_hash = ? ORDER BY created_at ASC LIMIT 1",
            DOCUMENT_COLUMNS
        ))
        .bind(dedup_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        // FTS5 tables do not take part in foreign-key cascades.
        sqlx::query("DELETE FROM segments_fts WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.external_id, d.title, d.source, d.status,
                   COUNT(s.id) AS segment_count
            FROM documents d
            LEFT JOIN segments s ON s.document_id = d.id
            GROUP BY d.id
            ORDER BY d.created_at ASC, d.rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(DocumentSummary {
                    id: row.get("id"),
                    external_id: row.get("external_id"),
                    title: row.get("title"),
                    source: row.get("source"),
                    status: DocumentStatus::parse(&status)
                        .ok_or_else(|| anyhow!("invalid document status '{}'", status))?,
                    segment_count: row.get("segment_count"),
                })
            })
            .collect()
    }

    async fn segments_by_ids(&self, ids: &[String]) -> Result<Vec<Segment>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, document_id, chunk_index, content FROM segments WHERE id IN ",
        );
        push_id_list(&mut builder, ids);
        builder.push(" ORDER BY document_id ASC, chunk_index ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(segment_from_row).collect())
    }

    async fn phrase_search(
        &self,
        phrase: &str,
        document_ids: &[String],
        limit: i64,
    ) -> Result<Vec<Segment>> {
        if document_ids.is_empty() || phrase.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT s.id, s.document_id, s.chunk_index, s.content
            FROM segments_fts
            JOIN segments s ON s.id = segments_fts.segment_id
            WHERE segments_fts MATCH "#,
        );
        builder.push_bind(format!("\"{}\"", phrase));
        builder.push(" AND s.document_id IN ");
        push_id_list(&mut builder, document_ids);
        builder.push(" ORDER BY segments_fts.rank, s.document_id, s.chunk_index LIMIT ");
        builder.push_bind(limit);

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(segment_from_row).collect())
    }

    async fn segments_in_order(
        &self,
        document_ids: &[String],
        limit: i64,
    ) -> Result<Vec<Segment>> {
        if document_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, document_id, chunk_index, content FROM segments WHERE document_id IN ",
        );
        push_id_list(&mut builder, document_ids);
        builder.push(" ORDER BY document_id ASC, chunk_index ASC LIMIT ");
        builder.push_bind(limit);

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(segment_from_row).collect())
    }

    async fn add_to_working_set(&self, document_id: &str) -> Result<()> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            bail!("unknown document {}", document_id);
        }

        sqlx::query("INSERT OR IGNORE INTO working_set (document_id, added_at) VALUES (?, ?)")
            .bind(document_id)
            .bind(now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_from_working_set(&self, document_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM working_set WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn working_set(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT document_id FROM working_set ORDER BY added_at ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn create_message(&self, first: &NewVersion) -> Result<(Message, Version)> {
        let ts = now();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            status: MessageStatus::Draft,
            created_at: ts,
            updated_at: ts,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO messages (id, status, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(&message.id)
            .bind(message.status.as_str())
            .bind(message.created_at)
            .bind(message.updated_at)
            .execute(&mut *tx)
            .await?;
        let version = Self::write_version(&mut tx, &message.id, first, ts).await?;
        tx.commit().await?;

        Ok((message, version))
    }

    async fn append_version(&self, message_id: &str, version: &NewVersion) -> Result<Version> {
        let ts = now();
        let mut attempt = 0;
        loop {
            match self.try_append(message_id, version, ts).await {
                Err(e) if attempt + 1 < APPEND_ATTEMPTS && is_write_conflict(&e) => {
                    attempt += 1;
                    warn!(attempt, error = %e, "version append conflicted, retrying");
                    tokio::time::sleep(Duration::from_millis(25 << attempt)).await;
                }
                result => return result,
            }
        }
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let row =
            sqlx::query("SELECT id, status, created_at, updated_at FROM messages WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn set_message_status(
        &self,
        id: &str,
        status: MessageStatus,
    ) -> Result<Option<Message>> {
        let result = sqlx::query("UPDATE messages SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_message(id).await
    }

    async fn latest_version(&self, message_id: &str) -> Result<Option<Version>> {
        let row = sqlx::query(
            r#"
            SELECT id, message_id, version_number, instruction, text, source, created_at
            FROM message_versions
            WHERE message_id = ?
            ORDER BY version_number DESC
            LIMIT 1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate_version(&row).await?)),
            None => Ok(None),
        }
    }

    async fn versions(&self, message_id: &str) -> Result<Vec<Version>> {
        let rows = sqlx::query(
            r#"
            SELECT id, message_id, version_number, instruction, text, source, created_at
            FROM message_versions
            WHERE message_id = ?
            ORDER BY version_number ASC
            "#,
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        let mut versions = Vec::with_capacity(rows.len());
        for row in &rows {
            versions.push(self.hydrate_version(row).await?);
        }
        Ok(versions)
    }

    async fn list_messages(&self) -> Result<Vec<MessageSummary>> {
        let rows = sqlx::query(
            "SELECT id, status, created_at, updated_at FROM messages ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let message = message_from_row(row)?;
            if let Some(latest) = self.latest_version(&message.id).await? {
                summaries.push(MessageSummary {
                    id: message.id,
                    status: message.status,
                    created_at: message.created_at,
                    updated_at: message.updated_at,
                    latest_version: latest,
                });
            }
        }
        Ok(summaries)
    }
}
