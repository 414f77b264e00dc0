use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::{PgPool, PgPooledConnection};
use crate::kit_health::HealthRecord;

#[derive(Clone)]
pub struct HealthRepository {
    pool: PgPool,
}

impl HealthRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PgPooledConnection> {
        self.pool.get().context("getting health connection")
    }

    pub fn insert_batch(&self, records: &[HealthRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        use crate::schema::kit_health::dsl::*;
        let mut conn = self.conn()?;
        let n = diesel::insert_into(kit_health)
            .values(records)
            .on_conflict_do_nothing()
            .execute(&mut conn)?;
        Ok(n)
    }

    /// Most recent health sample per kit inside a window, restricted to
    /// samples that actually report a position. These are the observer
    /// coordinates for trilateration.
    pub fn kit_positions_near(
        &self,
        center: DateTime<Utc>,
        window_secs: i64,
    ) -> Result<Vec<HealthRecord>> {
        use crate::schema::kit_health::dsl::*;
        let mut conn = self.conn()?;
        let half = chrono::Duration::seconds(window_secs);
        let rows = kit_health
            .filter(time.ge(center - half))
            .filter(time.le(center + half))
            .filter(lat.is_not_null())
            .filter(lon.is_not_null())
            .order((kit_id.asc(), time.desc()))
            .distinct_on(kit_id)
            .select(HealthRecord::as_select())
            .load::<HealthRecord>(&mut conn)?;
        Ok(rows)
    }

    /// Liveness probe for `/health`: one round trip to the store.
    pub fn ping(&self) -> Result<()> {
        let mut conn = self.conn()?;
        diesel::sql_query("SELECT 1").execute(&mut conn)?;
        Ok(())
    }
}
