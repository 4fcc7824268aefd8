//! Postgres-backed repository and event queue implementations.

mod events;
mod timestamps;
mod util;

pub use events::{PgEventQueue, PgEventQueueConfig};
pub use util::map_sqlx_error;

use std::sync::Arc;

use sqlx::{
    Postgres, QueryBuilder,
    postgres::{PgPool, PgPoolOptions},
    query,
    types::Json,
};

use crate::domain::timestamps::TimestampQuery;

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }

    fn apply_timestamp_filter<'q>(qb: &mut QueryBuilder<'q, Postgres>, filter: &'q TimestampQuery) {
        if let Some(external_id) = filter.external_id.as_ref() {
            qb.push(" AND t.external_id = ");
            qb.push_bind(external_id);
        }

        if let Some(tag) = filter.tag {
            qb.push(" AND t.tag = ");
            qb.push_bind(tag);
        }

        if let Some(stage) = filter.stage {
            qb.push(" AND t.stage = ");
            qb.push_bind(stage);
        }

        if let Some(from) = filter.from {
            qb.push(" AND t.occurred_at >= ");
            qb.push_bind(from);
        }

        if let Some(to) = filter.to {
            qb.push(" AND t.occurred_at <= ");
            qb.push_bind(to);
        }

        if !filter.meta.is_empty() {
            qb.push(" AND t.meta @> ");
            qb.push_bind(Json(&filter.meta));
        }
    }
}
