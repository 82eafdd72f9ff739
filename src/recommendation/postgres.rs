//! PostgreSQL-backed vector store
//!
//! Vectors live in JSONB columns as arrays of floats. Some ingestion paths
//! wrote them double-encoded (a JSON string holding the array); both shapes
//! are accepted. A value that does not parse as a float array is treated as
//! absent and logged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use tracing::{instrument, warn};
use uuid::Uuid;

use super::interactions::{InteractionEvent, InteractionType};
use super::store::{BookSummary, EmbeddingCoverage, FallbackStrategy, UserVectors, VectorStore};
use super::vector::{EmbeddingSpace, EmbeddingVector};
use super::BookId;
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct PgVectorStore {
    pool: PgPool,
}

impl PgVectorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// JSONB column holding the book vector for a space
fn book_column(space: EmbeddingSpace) -> &'static str {
    match space {
        EmbeddingSpace::Content => "content_embedding",
        EmbeddingSpace::Collaborative => "cf_embedding",
        EmbeddingSpace::Graph => "gnn_vector",
    }
}

/// Decode a stored vector, accepting the double-encoded string form
fn decode_vector(value: Option<Value>, what: &str) -> Option<EmbeddingVector> {
    let value = match value? {
        Value::Null => return None,
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(inner) => inner,
            Err(e) => {
                warn!("Unparseable {} vector: {}", what, e);
                return None;
            }
        },
        other => other,
    };

    match serde_json::from_value::<EmbeddingVector>(value) {
        Ok(vector) if !vector.is_empty() => Some(vector),
        Ok(_) => None,
        Err(e) => {
            warn!("Malformed {} vector: {}", what, e);
            None
        }
    }
}

fn to_id_vec(ids: &HashSet<BookId>) -> Vec<i64> {
    ids.iter().copied().collect()
}

#[derive(Debug, sqlx::FromRow)]
struct UserVectorsRow {
    kyc_embedding: Option<Value>,
    cf_vector: Option<Value>,
}

#[derive(Debug, sqlx::FromRow)]
struct BookSummaryRow {
    id: i64,
    title: String,
    author: Option<String>,
    genres: Option<Vec<String>>,
}

#[derive(Debug, sqlx::FromRow)]
struct InteractionRow {
    user_id: Uuid,
    book_id: i64,
    interaction_type: String,
    rating: Option<f32>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct CoverageRow {
    users: i64,
    books: i64,
    interactions: i64,
    users_with_cf_vectors: i64,
    books_with_content_embeddings: i64,
    books_with_cf_embeddings: i64,
    books_with_gnn_vectors: i64,
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn count_books(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM books")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn get_user_vectors(&self, user_id: Uuid) -> Result<Option<UserVectors>> {
        let row = sqlx::query_as::<_, UserVectorsRow>(
            "SELECT kyc_embedding, cf_vector FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| UserVectors {
            content: decode_vector(row.kyc_embedding, "user content"),
            collaborative: decode_vector(row.cf_vector, "user collaborative"),
        }))
    }

    #[instrument(skip(self, exclude), fields(excluded = exclude.len()))]
    async fn get_book_vector_pool(
        &self,
        space: EmbeddingSpace,
        exclude: &HashSet<BookId>,
    ) -> Result<Vec<(BookId, EmbeddingVector)>> {
        let column = book_column(space);
        let query = format!(
            "SELECT id, {column} FROM books WHERE {column} IS NOT NULL AND id <> ALL($1) ORDER BY id",
        );

        let rows: Vec<(i64, Option<Value>)> = sqlx::query_as(&query)
            .bind(to_id_vec(exclude))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, value)| decode_vector(value, space.as_str()).map(|v| (id, v)))
            .collect())
    }

    async fn get_interacted_books(&self, user_id: Uuid) -> Result<HashSet<BookId>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT DISTINCT book_id FROM interactions WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }

    async fn get_book_vectors(
        &self,
        space: EmbeddingSpace,
        book_ids: &[BookId],
    ) -> Result<HashMap<BookId, EmbeddingVector>> {
        if book_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let column = book_column(space);
        let query = format!(
            "SELECT id, {column} FROM books WHERE id = ANY($1) AND {column} IS NOT NULL",
        );

        let rows: Vec<(i64, Option<Value>)> = sqlx::query_as(&query)
            .bind(book_ids)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, value)| decode_vector(value, space.as_str()).map(|v| (id, v)))
            .collect())
    }

    #[instrument(skip(self, exclude))]
    async fn get_fallback_books(
        &self,
        strategy: FallbackStrategy,
        exclude: &HashSet<BookId>,
        limit: usize,
    ) -> Result<Vec<BookId>> {
        let query = match strategy {
            FallbackStrategy::Popularity => {
                r#"
                SELECT b.id
                FROM books b
                LEFT JOIN interactions i ON i.book_id = b.id
                WHERE b.id <> ALL($1)
                GROUP BY b.id
                ORDER BY COUNT(i.id) DESC, b.id ASC
                LIMIT $2
                "#
            }
            FallbackStrategy::MostRecent => {
                r#"
                SELECT id
                FROM books
                WHERE id <> ALL($1)
                ORDER BY created_at DESC, id ASC
                LIMIT $2
                "#
            }
        };

        let ids: Vec<i64> = sqlx::query_scalar(query)
            .bind(to_id_vec(exclude))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn get_book_summaries(&self, book_ids: &[BookId]) -> Result<HashMap<BookId, BookSummary>> {
        if book_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, BookSummaryRow>(
            "SELECT id, title, author, genres FROM books WHERE id = ANY($1)",
        )
        .bind(book_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.id,
                    BookSummary {
                        id: row.id,
                        title: row.title,
                        author: row.author,
                        genres: row.genres.unwrap_or_default(),
                    },
                )
            })
            .collect())
    }

    #[instrument(skip(self, event), fields(user_id = %event.user_id, book_id = event.book_id))]
    async fn record_interaction(&self, event: &InteractionEvent) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO interactions (user_id, book_id, interaction_type, rating, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.user_id)
        .bind(event.book_id)
        .bind(event.interaction_type.to_string())
        .bind(event.rating)
        .bind(event.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.kind() == sqlx::error::ErrorKind::ForeignKeyViolation =>
            {
                Err(Error::bad_request("unknown user or book"))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_interactions(&self) -> Result<Vec<InteractionEvent>> {
        let rows = sqlx::query_as::<_, InteractionRow>(
            r#"
            SELECT user_id, book_id, interaction_type, rating, created_at
            FROM interactions
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let interaction_type = match row.interaction_type.parse::<InteractionType>() {
                Ok(t) => t,
                Err(_) => {
                    warn!("Skipping interaction with unknown type '{}'", row.interaction_type);
                    continue;
                }
            };
            events.push(InteractionEvent {
                user_id: row.user_id,
                book_id: row.book_id,
                interaction_type,
                rating: row.rating,
                created_at: row.created_at,
            });
        }
        Ok(events)
    }

    #[instrument(skip(self))]
    async fn embedding_coverage(&self) -> Result<EmbeddingCoverage> {
        let row = sqlx::query_as::<_, CoverageRow>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM users) AS users,
                (SELECT COUNT(*) FROM books) AS books,
                (SELECT COUNT(*) FROM interactions) AS interactions,
                (SELECT COUNT(*) FROM users WHERE cf_vector IS NOT NULL) AS users_with_cf_vectors,
                (SELECT COUNT(*) FROM books WHERE content_embedding IS NOT NULL)
                    AS books_with_content_embeddings,
                (SELECT COUNT(*) FROM books WHERE cf_embedding IS NOT NULL)
                    AS books_with_cf_embeddings,
                (SELECT COUNT(*) FROM books WHERE gnn_vector IS NOT NULL)
                    AS books_with_gnn_vectors
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |n: i64| n.max(0) as u64;
        Ok(EmbeddingCoverage {
            users: count(row.users),
            books: count(row.books),
            interactions: count(row.interactions),
            users_with_cf_vectors: count(row.users_with_cf_vectors),
            books_with_content_embeddings: count(row.books_with_content_embeddings),
            books_with_cf_embeddings: count(row.books_with_cf_embeddings),
            books_with_gnn_vectors: count(row.books_with_gnn_vectors),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_vector_shapes() {
        let plain = decode_vector(Some(json!([0.5, 1.0])), "test").unwrap();
        assert_eq!(plain.as_slice(), &[0.5, 1.0]);

        let double_encoded = decode_vector(Some(json!("[0.25, 2.0]")), "test").unwrap();
        assert_eq!(double_encoded.as_slice(), &[0.25, 2.0]);

        assert!(decode_vector(None, "test").is_none());
        assert!(decode_vector(Some(Value::Null), "test").is_none());
        assert!(decode_vector(Some(json!([])), "test").is_none());
        assert!(decode_vector(Some(json!({"a": 1})), "test").is_none());
    }

    #[test]
    fn test_book_columns() {
        assert_eq!(book_column(EmbeddingSpace::Content), "content_embedding");
        assert_eq!(book_column(EmbeddingSpace::Collaborative), "cf_embedding");
        assert_eq!(book_column(EmbeddingSpace::Graph), "gnn_vector");
    }

    #[tokio::test]
    async fn test_pg_store_counts_books() {
        // Requires a running database with migrations applied
        let url = match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => return,
        };

        let pool = PgPool::connect(&url).await.unwrap();
        let store = PgVectorStore::new(pool);
        let books = store.count_books().await.unwrap();
        let coverage = store.embedding_coverage().await.unwrap();
        assert_eq!(coverage.books, books);
        assert!(coverage.books_with_gnn_vectors <= coverage.books);
    }
}
