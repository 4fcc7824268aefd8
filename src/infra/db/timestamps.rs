use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{QueryBuilder, types::Json};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{RepoError, TimestampsRepo},
    domain::{
        entities::TimestampRecord,
        timestamps::{NewTimestamp, TimestampQuery},
        types::{Stage, Tag},
    },
};

use super::{PostgresRepositories, map_sqlx_error};

const SELECT_TIMESTAMP: &str =
    "SELECT t.id, t.external_id, t.occurred_at, t.tag, t.stage, t.meta FROM timestamps t";

#[derive(sqlx::FromRow)]
struct TimestampRow {
    id: Uuid,
    external_id: String,
    occurred_at: OffsetDateTime,
    tag: Tag,
    stage: Stage,
    meta: Json<Map<String, Value>>,
}

impl From<TimestampRow> for TimestampRecord {
    fn from(row: TimestampRow) -> Self {
        Self {
            id: row.id,
            external_id: row.external_id,
            timestamp: row.occurred_at,
            tag: row.tag,
            stage: row.stage,
            meta: row.meta.0,
        }
    }
}

#[async_trait]
impl TimestampsRepo for PostgresRepositories {
    async fn create_timestamp(&self, new: &NewTimestamp) -> Result<Uuid, RepoError> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO timestamps (external_id, occurred_at, tag, stage, meta)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&new.external_id)
        .bind(new.timestamp)
        .bind(new.tag)
        .bind(new.stage)
        .bind(Json(&new.meta))
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn find_timestamp(&self, id: Uuid) -> Result<Option<TimestampRecord>, RepoError> {
        let row = sqlx::query_as::<_, TimestampRow>(&format!("{SELECT_TIMESTAMP} WHERE t.id = $1"))
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(TimestampRecord::from))
    }

    async fn delete_timestamp(&self, id: Uuid) -> Result<(), RepoError> {
        let result = sqlx::query("DELETE FROM timestamps WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn list_timestamps(
        &self,
        query: &TimestampQuery,
    ) -> Result<Vec<TimestampRecord>, RepoError> {
        let mut qb = QueryBuilder::new(SELECT_TIMESTAMP);
        qb.push(" WHERE TRUE");
        Self::apply_timestamp_filter(&mut qb, query);
        qb.push(" ORDER BY t.occurred_at DESC, t.id DESC LIMIT ");
        qb.push_bind(i64::from(query.limit));
        qb.push(" OFFSET ");
        qb.push_bind(i64::from(query.offset));

        let rows = qb
            .build_query_as::<TimestampRow>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(TimestampRecord::from).collect())
    }

    async fn ping(&self) -> Result<(), RepoError> {
        self.health_check().await.map_err(map_sqlx_error)
    }
}
