use anyhow::{Context, Result};
use diesel::prelude::*;

use crate::db::{PgPool, PgPooledConnection};
use crate::signals::SignalRecord;
use crate::time_range::TimeRange;

/// Filter set for `/api/signals`.
#[derive(Debug, Clone)]
pub struct SignalQuery {
    pub range: TimeRange,
    pub kit_ids: Option<Vec<String>>,
    pub detection_type: Option<String>,
    pub limit: i64,
}

#[derive(Clone)]
pub struct SignalsRepository {
    pool: PgPool,
}

impl SignalsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PgPooledConnection> {
        self.pool.get().context("getting signals connection")
    }

    pub fn insert_batch(&self, records: &[SignalRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        use crate::schema::signals::dsl::*;
        let mut conn = self.conn()?;
        let n = diesel::insert_into(signals)
            .values(records)
            .on_conflict_do_nothing()
            .execute(&mut conn)?;
        Ok(n)
    }

    pub fn query(&self, q: &SignalQuery) -> Result<Vec<SignalRecord>> {
        use crate::schema::signals::dsl::*;
        let mut conn = self.conn()?;

        let mut query = signals
            .filter(time.ge(q.range.start))
            .filter(time.le(q.range.end))
            .select(SignalRecord::as_select())
            .into_boxed();

        if let Some(ids) = &q.kit_ids {
            query = query.filter(kit_id.eq_any(ids.clone()));
        }
        if let Some(dt) = &q.detection_type {
            query = query.filter(detection_type.eq(dt.clone()));
        }

        let rows = query
            .order(time.desc())
            .limit(q.limit)
            .load::<SignalRecord>(&mut conn)?;
        Ok(rows)
    }
}
