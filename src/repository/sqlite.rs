//! SQLite outbox and inbox repositories.
//!
//! Uniqueness is enforced by the schema: `event_id` is the outbox primary key, the
//! inbox is keyed by `(consumer, event_id)` and carries a unique
//! `(consumer, stream, stream_seq)` index. Inserts use
//! `ON CONFLICT DO NOTHING` followed by a lookup, and status claims are single
//! conditional `UPDATE`s, so concurrent callers never interleave a read and a write.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{
    Alias, ColumnDef, Cond, Expr, Iden, Index, OnConflict, Order, Query, SqliteQueryBuilder, Table,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;

use super::{
    timestamp, InboxEvent, InboxRepository, InboxStats, InboxStatus, NewInboxEvent,
    NewOutboxEvent, OutboxEvent, OutboxRepository, OutboxStats, OutboxStatus, Result,
    StorageError,
};

// ============================================================================
// Schema
// ============================================================================

/// Outbox table schema.
#[derive(Iden)]
enum CourierOutbox {
    #[iden = "courier_outbox"]
    Table,
    #[iden = "event_id"]
    EventId,
    #[iden = "subject"]
    Subject,
    #[iden = "payload"]
    Payload,
    #[iden = "headers"]
    Headers,
    #[iden = "status"]
    Status,
    #[iden = "attempts"]
    Attempts,
    #[iden = "error_message"]
    ErrorMessage,
    #[iden = "enqueued_at"]
    EnqueuedAt,
    #[iden = "updated_at"]
    UpdatedAt,
    #[iden = "sent_at"]
    SentAt,
}

/// Inbox table schema.
#[derive(Iden)]
enum CourierInbox {
    #[iden = "courier_inbox"]
    Table,
    #[iden = "consumer"]
    Consumer,
    #[iden = "event_id"]
    EventId,
    #[iden = "stream"]
    Stream,
    #[iden = "stream_seq"]
    StreamSeq,
    #[iden = "subject"]
    Subject,
    #[iden = "payload"]
    Payload,
    #[iden = "status"]
    Status,
    #[iden = "deliveries"]
    Deliveries,
    #[iden = "error_message"]
    ErrorMessage,
    #[iden = "received_at"]
    ReceivedAt,
    #[iden = "updated_at"]
    UpdatedAt,
    #[iden = "processed_at"]
    ProcessedAt,
}

fn parse_time(key: &str, text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: format!("bad timestamp '{}': {}", text, e),
        })
}

fn parse_optional_time(key: &str, text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.map(|t| parse_time(key, &t)).transpose()
}

fn count_column(row: &SqliteRow, column: &str) -> Result<u32> {
    let value: i64 = row.try_get(column)?;
    Ok(u32::try_from(value).unwrap_or(u32::MAX))
}

// ============================================================================
// Outbox
// ============================================================================

/// SQLite outbox repository.
pub struct SqliteOutboxRepository {
    pool: SqlitePool,
}

impl SqliteOutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the outbox table and its indexes.
    pub async fn init(&self) -> Result<()> {
        let create_table = Table::create()
            .table(CourierOutbox::Table)
            .if_not_exists()
            .col(ColumnDef::new(CourierOutbox::EventId).text().primary_key())
            .col(ColumnDef::new(CourierOutbox::Subject).text().not_null())
            .col(ColumnDef::new(CourierOutbox::Payload).blob().not_null())
            .col(ColumnDef::new(CourierOutbox::Headers).text().not_null())
            .col(ColumnDef::new(CourierOutbox::Status).text().not_null())
            .col(
                ColumnDef::new(CourierOutbox::Attempts)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .col(ColumnDef::new(CourierOutbox::ErrorMessage).text())
            .col(ColumnDef::new(CourierOutbox::EnqueuedAt).text().not_null())
            .col(ColumnDef::new(CourierOutbox::UpdatedAt).text().not_null())
            .col(ColumnDef::new(CourierOutbox::SentAt).text())
            .to_string(SqliteQueryBuilder);
        sqlx::query(&create_table).execute(&self.pool).await?;

        let create_index = Index::create()
            .if_not_exists()
            .name("idx_courier_outbox_status_enqueued")
            .table(CourierOutbox::Table)
            .col(CourierOutbox::Status)
            .col(CourierOutbox::EnqueuedAt)
            .to_string(SqliteQueryBuilder);
        sqlx::query(&create_index).execute(&self.pool).await?;

        info!("Outbox table initialized (SQLite)");
        Ok(())
    }

    fn decode(row: &SqliteRow) -> Result<OutboxEvent> {
        let event_id: String = row.try_get("event_id")?;
        let status: String = row.try_get("status")?;
        let headers: String = row.try_get("headers")?;
        let enqueued_at: String = row.try_get("enqueued_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        Ok(OutboxEvent {
            subject: row.try_get("subject")?,
            payload: row.try_get("payload")?,
            headers: serde_json::from_str::<HashMap<String, String>>(&headers)?,
            status: status.parse().map_err(|reason| StorageError::Corrupt {
                key: event_id.clone(),
                reason,
            })?,
            attempts: count_column(row, "attempts")?,
            error_message: row.try_get("error_message")?,
            enqueued_at: parse_time(&event_id, &enqueued_at)?,
            updated_at: parse_time(&event_id, &updated_at)?,
            sent_at: parse_optional_time(&event_id, row.try_get("sent_at")?)?,
            event_id,
        })
    }

    fn select() -> sea_query::SelectStatement {
        Query::select()
            .columns([
                CourierOutbox::EventId,
                CourierOutbox::Subject,
                CourierOutbox::Payload,
                CourierOutbox::Headers,
                CourierOutbox::Status,
                CourierOutbox::Attempts,
                CourierOutbox::ErrorMessage,
                CourierOutbox::EnqueuedAt,
                CourierOutbox::UpdatedAt,
                CourierOutbox::SentAt,
            ])
            .from(CourierOutbox::Table)
            .to_owned()
    }
}

#[async_trait]
impl OutboxRepository for SqliteOutboxRepository {
    async fn find_or_create(&self, event: NewOutboxEvent) -> Result<(OutboxEvent, bool)> {
        let event_id = event.event_id.clone();
        let now = timestamp(Utc::now());
        let headers = serde_json::to_string(&event.headers)?;

        let insert = Query::insert()
            .into_table(CourierOutbox::Table)
            .columns([
                CourierOutbox::EventId,
                CourierOutbox::Subject,
                CourierOutbox::Payload,
                CourierOutbox::Headers,
                CourierOutbox::Status,
                CourierOutbox::Attempts,
                CourierOutbox::EnqueuedAt,
                CourierOutbox::UpdatedAt,
            ])
            .values_panic([
                event.event_id.into(),
                event.subject.into(),
                event.payload.into(),
                headers.into(),
                OutboxStatus::Pending.as_str().into(),
                0i32.into(),
                now.clone().into(),
                now.into(),
            ])
            .on_conflict(
                OnConflict::column(CourierOutbox::EventId)
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        let created = sqlx::query(&insert)
            .execute(&self.pool)
            .await?
            .rows_affected()
            == 1;
        let row = self
            .get(&event_id)
            .await?
            .ok_or(StorageError::NotFound(event_id))?;
        Ok((row, created))
    }

    async fn get(&self, event_id: &str) -> Result<Option<OutboxEvent>> {
        let query = Self::select()
            .and_where(Expr::col(CourierOutbox::EventId).eq(event_id))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn mark_publishing(&self, event_id: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        let query = Query::update()
            .table(CourierOutbox::Table)
            .value(CourierOutbox::Status, OutboxStatus::Publishing.as_str())
            .value(
                CourierOutbox::Attempts,
                Expr::col(CourierOutbox::Attempts).add(1),
            )
            .value(CourierOutbox::UpdatedAt, timestamp(Utc::now()))
            .and_where(Expr::col(CourierOutbox::EventId).eq(event_id))
            .cond_where(
                Cond::any()
                    .add(Expr::col(CourierOutbox::Status).is_in([
                        OutboxStatus::Pending.as_str(),
                        OutboxStatus::Failed.as_str(),
                    ]))
                    .add(
                        Cond::all()
                            .add(
                                Expr::col(CourierOutbox::Status)
                                    .eq(OutboxStatus::Publishing.as_str()),
                            )
                            .add(Expr::col(CourierOutbox::UpdatedAt).lt(timestamp(stale_before))),
                    ),
            )
            .to_string(SqliteQueryBuilder);

        let claimed = sqlx::query(&query)
            .execute(&self.pool)
            .await?
            .rows_affected()
            == 1;
        if !claimed && self.get(event_id).await?.is_none() {
            return Err(StorageError::NotFound(event_id.to_string()));
        }
        Ok(claimed)
    }

    async fn mark_as_sent(&self, event_id: &str) -> Result<()> {
        let now = timestamp(Utc::now());
        let query = Query::update()
            .table(CourierOutbox::Table)
            .value(CourierOutbox::Status, OutboxStatus::Sent.as_str())
            .value(CourierOutbox::ErrorMessage, Option::<String>::None)
            .value(CourierOutbox::UpdatedAt, now.clone())
            .value(CourierOutbox::SentAt, now)
            .and_where(Expr::col(CourierOutbox::EventId).eq(event_id))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(event_id.to_string()));
        }
        Ok(())
    }

    async fn mark_as_failed(&self, event_id: &str, error: &str) -> Result<()> {
        let query = Query::update()
            .table(CourierOutbox::Table)
            .value(CourierOutbox::Status, OutboxStatus::Failed.as_str())
            .value(CourierOutbox::ErrorMessage, error)
            .value(CourierOutbox::UpdatedAt, timestamp(Utc::now()))
            .and_where(Expr::col(CourierOutbox::EventId).eq(event_id))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(event_id.to_string()));
        }
        Ok(())
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let query = Self::select()
            .and_where(Expr::col(CourierOutbox::Status).eq(OutboxStatus::Pending.as_str()))
            .order_by(CourierOutbox::EnqueuedAt, Order::Asc)
            .order_by(CourierOutbox::EventId, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::decode).collect()
    }

    async fn requeue_failed(&self, max_attempts: u32) -> Result<u64> {
        let query = Query::update()
            .table(CourierOutbox::Table)
            .value(CourierOutbox::Status, OutboxStatus::Pending.as_str())
            .value(CourierOutbox::UpdatedAt, timestamp(Utc::now()))
            .and_where(Expr::col(CourierOutbox::Status).eq(OutboxStatus::Failed.as_str()))
            .and_where(Expr::col(CourierOutbox::Attempts).lt(max_attempts))
            .to_string(SqliteQueryBuilder);
        Ok(sqlx::query(&query).execute(&self.pool).await?.rows_affected())
    }

    async fn reset_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let query = Query::update()
            .table(CourierOutbox::Table)
            .value(CourierOutbox::Status, OutboxStatus::Pending.as_str())
            .value(CourierOutbox::UpdatedAt, timestamp(Utc::now()))
            .and_where(Expr::col(CourierOutbox::Status).eq(OutboxStatus::Publishing.as_str()))
            .and_where(Expr::col(CourierOutbox::UpdatedAt).lt(timestamp(cutoff)))
            .to_string(SqliteQueryBuilder);
        Ok(sqlx::query(&query).execute(&self.pool).await?.rows_affected())
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let query = Query::delete()
            .from_table(CourierOutbox::Table)
            .and_where(Expr::col(CourierOutbox::Status).eq(OutboxStatus::Sent.as_str()))
            .and_where(Expr::col(CourierOutbox::SentAt).lt(timestamp(cutoff)))
            .to_string(SqliteQueryBuilder);
        Ok(sqlx::query(&query).execute(&self.pool).await?.rows_affected())
    }

    async fn count_by_status(&self) -> Result<OutboxStats> {
        let query = Query::select()
            .column(CourierOutbox::Status)
            .expr_as(Expr::cust("COUNT(*)"), Alias::new("n"))
            .from(CourierOutbox::Table)
            .group_by_col(CourierOutbox::Status)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            let status = status.parse().map_err(|reason| StorageError::Corrupt {
                key: "courier_outbox".to_string(),
                reason,
            })?;
            stats.add(status, count as u64);
        }
        Ok(stats)
    }
}

// ============================================================================
// Inbox
// ============================================================================

/// SQLite inbox repository.
pub struct SqliteInboxRepository {
    pool: SqlitePool,
}

impl SqliteInboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the inbox table and its indexes.
    pub async fn init(&self) -> Result<()> {
        let create_table = Table::create()
            .table(CourierInbox::Table)
            .if_not_exists()
            .col(ColumnDef::new(CourierInbox::Consumer).text().not_null())
            .col(ColumnDef::new(CourierInbox::EventId).text().not_null())
            .col(ColumnDef::new(CourierInbox::Stream).text().not_null())
            .col(ColumnDef::new(CourierInbox::StreamSeq).big_integer().not_null())
            .col(ColumnDef::new(CourierInbox::Subject).text().not_null())
            .col(ColumnDef::new(CourierInbox::Payload).blob().not_null())
            .col(ColumnDef::new(CourierInbox::Status).text().not_null())
            .col(
                ColumnDef::new(CourierInbox::Deliveries)
                    .integer()
                    .not_null()
                    .default(1),
            )
            .col(ColumnDef::new(CourierInbox::ErrorMessage).text())
            .col(ColumnDef::new(CourierInbox::ReceivedAt).text().not_null())
            .col(ColumnDef::new(CourierInbox::UpdatedAt).text().not_null())
            .col(ColumnDef::new(CourierInbox::ProcessedAt).text())
            .primary_key(
                Index::create()
                    .col(CourierInbox::Consumer)
                    .col(CourierInbox::EventId),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&create_table).execute(&self.pool).await?;

        let unique_position = Index::create()
            .if_not_exists()
            .unique()
            .name("idx_courier_inbox_position")
            .table(CourierInbox::Table)
            .col(CourierInbox::Consumer)
            .col(CourierInbox::Stream)
            .col(CourierInbox::StreamSeq)
            .to_string(SqliteQueryBuilder);
        sqlx::query(&unique_position).execute(&self.pool).await?;

        let status_index = Index::create()
            .if_not_exists()
            .name("idx_courier_inbox_status")
            .table(CourierInbox::Table)
            .col(CourierInbox::Status)
            .to_string(SqliteQueryBuilder);
        sqlx::query(&status_index).execute(&self.pool).await?;

        info!("Inbox table initialized (SQLite)");
        Ok(())
    }

    fn decode(row: &SqliteRow) -> Result<InboxEvent> {
        let event_id: String = row.try_get("event_id")?;
        let status: String = row.try_get("status")?;
        let stream_seq: i64 = row.try_get("stream_seq")?;
        let received_at: String = row.try_get("received_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        Ok(InboxEvent {
            consumer: row.try_get("consumer")?,
            stream: row.try_get("stream")?,
            stream_seq: stream_seq as u64,
            subject: row.try_get("subject")?,
            payload: row.try_get("payload")?,
            status: status.parse().map_err(|reason| StorageError::Corrupt {
                key: event_id.clone(),
                reason,
            })?,
            deliveries: count_column(row, "deliveries")?,
            error_message: row.try_get("error_message")?,
            received_at: parse_time(&event_id, &received_at)?,
            updated_at: parse_time(&event_id, &updated_at)?,
            processed_at: parse_optional_time(&event_id, row.try_get("processed_at")?)?,
            event_id,
        })
    }

    fn select() -> sea_query::SelectStatement {
        Query::select()
            .columns([
                CourierInbox::Consumer,
                CourierInbox::EventId,
                CourierInbox::Stream,
                CourierInbox::StreamSeq,
                CourierInbox::Subject,
                CourierInbox::Payload,
                CourierInbox::Status,
                CourierInbox::Deliveries,
                CourierInbox::ErrorMessage,
                CourierInbox::ReceivedAt,
                CourierInbox::UpdatedAt,
                CourierInbox::ProcessedAt,
            ])
            .from(CourierInbox::Table)
            .to_owned()
    }

    async fn get_by_position(
        &self,
        consumer: &str,
        stream: &str,
        stream_seq: u64,
    ) -> Result<Option<InboxEvent>> {
        let query = Self::select()
            .and_where(Expr::col(CourierInbox::Consumer).eq(consumer))
            .and_where(Expr::col(CourierInbox::Stream).eq(stream))
            .and_where(Expr::col(CourierInbox::StreamSeq).eq(stream_seq as i64))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn set_status(
        &self,
        consumer: &str,
        key: &str,
        status: InboxStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = timestamp(Utc::now());
        // UpdateStatement is !Send; render it before the first await.
        let query = {
            let mut update = Query::update();
            update
                .table(CourierInbox::Table)
                .value(CourierInbox::Status, status.as_str())
                .value(CourierInbox::ErrorMessage, error.map(str::to_string))
                .value(CourierInbox::UpdatedAt, now.clone())
                .and_where(Expr::col(CourierInbox::Consumer).eq(consumer))
                .and_where(Expr::col(CourierInbox::EventId).eq(key));
            if status == InboxStatus::Processed {
                update.value(CourierInbox::ProcessedAt, now);
            }
            update.to_string(SqliteQueryBuilder)
        };
        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("{}/{}", consumer, key)));
        }
        Ok(())
    }
}

#[async_trait]
impl InboxRepository for SqliteInboxRepository {
    async fn find_or_create(&self, event: NewInboxEvent) -> Result<(InboxEvent, bool)> {
        let key = event.key();
        let consumer = event.consumer.clone();
        let stream = event.stream.clone();
        let stream_seq = event.stream_seq;
        let now = timestamp(Utc::now());

        // The position index may also collide; that surfaces as a unique violation.
        let insert = Query::insert()
            .into_table(CourierInbox::Table)
            .columns([
                CourierInbox::Consumer,
                CourierInbox::EventId,
                CourierInbox::Stream,
                CourierInbox::StreamSeq,
                CourierInbox::Subject,
                CourierInbox::Payload,
                CourierInbox::Status,
                CourierInbox::Deliveries,
                CourierInbox::ReceivedAt,
                CourierInbox::UpdatedAt,
            ])
            .values_panic([
                event.consumer.into(),
                key.clone().into(),
                event.stream.into(),
                (event.stream_seq as i64).into(),
                event.subject.into(),
                event.payload.into(),
                InboxStatus::Processing.as_str().into(),
                1i32.into(),
                now.clone().into(),
                now.into(),
            ])
            .on_conflict(
                OnConflict::columns([CourierInbox::Consumer, CourierInbox::EventId])
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        let created = match sqlx::query(&insert).execute(&self.pool).await {
            Ok(result) => result.rows_affected() == 1,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => false,
            Err(e) => return Err(e.into()),
        };

        if let Some(row) = self.get(&consumer, &key).await? {
            return Ok((row, created));
        }
        let row = self
            .get_by_position(&consumer, &stream, stream_seq)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", consumer, key)))?;
        Ok((row, false))
    }

    async fn get(&self, consumer: &str, key: &str) -> Result<Option<InboxEvent>> {
        let query = Self::select()
            .and_where(Expr::col(CourierInbox::Consumer).eq(consumer))
            .and_where(Expr::col(CourierInbox::EventId).eq(key))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn try_claim(
        &self,
        consumer: &str,
        key: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<InboxEvent>> {
        let query = Query::update()
            .table(CourierInbox::Table)
            .value(CourierInbox::Status, InboxStatus::Processing.as_str())
            .value(
                CourierInbox::Deliveries,
                Expr::col(CourierInbox::Deliveries).add(1),
            )
            .value(CourierInbox::UpdatedAt, timestamp(Utc::now()))
            .and_where(Expr::col(CourierInbox::Consumer).eq(consumer))
            .and_where(Expr::col(CourierInbox::EventId).eq(key))
            .cond_where(
                Cond::any()
                    .add(Expr::col(CourierInbox::Status).eq(InboxStatus::Failed.as_str()))
                    .add(
                        Cond::all()
                            .add(
                                Expr::col(CourierInbox::Status)
                                    .eq(InboxStatus::Processing.as_str()),
                            )
                            .add(Expr::col(CourierInbox::UpdatedAt).lt(timestamp(stale_before))),
                    ),
            )
            .to_string(SqliteQueryBuilder);

        let claimed = sqlx::query(&query)
            .execute(&self.pool)
            .await?
            .rows_affected()
            == 1;
        if !claimed {
            return Ok(None);
        }
        self.get(consumer, key).await
    }

    async fn mark_as_processed(&self, consumer: &str, key: &str) -> Result<()> {
        self.set_status(consumer, key, InboxStatus::Processed, None)
            .await
    }

    async fn mark_as_failed(&self, consumer: &str, key: &str, error: &str) -> Result<()> {
        self.set_status(consumer, key, InboxStatus::Failed, Some(error))
            .await
    }

    async fn reset_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let query = Query::update()
            .table(CourierInbox::Table)
            .value(CourierInbox::Status, InboxStatus::Failed.as_str())
            .value(CourierInbox::ErrorMessage, "processing timed out")
            .value(CourierInbox::UpdatedAt, timestamp(Utc::now()))
            .and_where(Expr::col(CourierInbox::Status).eq(InboxStatus::Processing.as_str()))
            .and_where(Expr::col(CourierInbox::UpdatedAt).lt(timestamp(cutoff)))
            .to_string(SqliteQueryBuilder);
        Ok(sqlx::query(&query).execute(&self.pool).await?.rows_affected())
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let query = Query::delete()
            .from_table(CourierInbox::Table)
            .and_where(Expr::col(CourierInbox::Status).is_in([
                InboxStatus::Processed.as_str(),
                InboxStatus::Failed.as_str(),
            ]))
            .and_where(Expr::col(CourierInbox::UpdatedAt).lt(timestamp(cutoff)))
            .to_string(SqliteQueryBuilder);
        Ok(sqlx::query(&query).execute(&self.pool).await?.rows_affected())
    }

    async fn count_by_status(&self) -> Result<InboxStats> {
        let query = Query::select()
            .column(CourierInbox::Status)
            .expr_as(Expr::cust("COUNT(*)"), Alias::new("n"))
            .from(CourierInbox::Table)
            .group_by_col(CourierInbox::Status)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut stats = InboxStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            let status = status.parse().map_err(|reason| StorageError::Corrupt {
                key: "courier_inbox".to_string(),
                reason,
            })?;
            stats.add(status, count as u64);
        }
        Ok(stats)
    }
}
