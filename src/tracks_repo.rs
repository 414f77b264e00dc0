use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::{PgPool, PgPooledConnection};
use crate::time_range::TimeRange;
use crate::tracks::TrackRecord;

/// Filter set for `/api/drones` and the CSV export.
#[derive(Debug, Clone)]
pub struct TrackQuery {
    pub range: TimeRange,
    pub kit_ids: Option<Vec<String>>,
    pub rid_make: Option<String>,
    pub track_type: Option<String>,
    pub limit: i64,
    pub deduplicate: bool,
}

/// Keyset cursor for paging through a track query: the composite key of
/// the last row the previous page returned.
#[derive(Debug, Clone)]
pub struct PageCursor {
    pub time: DateTime<Utc>,
    pub kit_id: String,
    pub drone_id: String,
}

impl PageCursor {
    pub fn from_last(rows: &[TrackRecord]) -> Option<Self> {
        rows.last().map(|t| Self {
            time: t.time,
            kit_id: t.kit_id.clone(),
            drone_id: t.drone_id.clone(),
        })
    }
}

#[derive(Clone)]
pub struct TracksRepository {
    pool: PgPool,
}

impl TracksRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PgPooledConnection> {
        self.pool.get().context("getting tracks connection")
    }

    /// Raw batch insert with composite-key conflicts silently ignored.
    /// Returns the number of rows actually written; the difference to the
    /// batch size is the conflict count. Validation happens in the writer.
    pub fn insert_batch(&self, records: &[TrackRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        use crate::schema::tracks::dsl::*;
        let mut conn = self.conn()?;
        let n = diesel::insert_into(tracks)
            .values(records)
            .on_conflict_do_nothing()
            .execute(&mut conn)?;
        Ok(n)
    }

    /// Filtered track query. With `deduplicate` the result keeps only the
    /// most recent row per drone (`DISTINCT ON (drone_id) ... ORDER BY
    /// drone_id, time DESC`); otherwise rows come back newest-first.
    pub fn query(&self, q: &TrackQuery) -> Result<Vec<TrackRecord>> {
        use crate::schema::tracks::dsl::*;
        let mut conn = self.conn()?;

        let mut query = tracks
            .filter(time.ge(q.range.start))
            .filter(time.le(q.range.end))
            .select(TrackRecord::as_select())
            .into_boxed();

        if let Some(ids) = &q.kit_ids {
            query = query.filter(kit_id.eq_any(ids.clone()));
        }
        if let Some(make) = &q.rid_make {
            query = query.filter(rid_make.eq(make.clone()));
        }
        if let Some(tt) = &q.track_type {
            query = query.filter(track_type.eq(tt.clone()));
        }

        let rows = if q.deduplicate {
            query
                .order((drone_id.asc(), time.desc()))
                .distinct_on(drone_id)
                .limit(q.limit)
                .load::<TrackRecord>(&mut conn)?
        } else {
            query.order(time.desc()).limit(q.limit).load::<TrackRecord>(&mut conn)?
        };
        Ok(rows)
    }

    /// One keyset page of the filtered query, for the CSV export. Pages
    /// never overlap: each page resumes strictly after `cursor`, so the
    /// caller holds at most `page_size` rows at a time. Ordering matches
    /// `query` with the composite key as tie-breaker (`DISTINCT ON` pages
    /// ascend by drone id, plain pages descend by time).
    pub fn query_page(
        &self,
        q: &TrackQuery,
        cursor: Option<&PageCursor>,
        page_size: i64,
    ) -> Result<Vec<TrackRecord>> {
        use crate::schema::tracks::dsl::*;
        let mut conn = self.conn()?;

        let mut query = tracks
            .filter(time.ge(q.range.start))
            .filter(time.le(q.range.end))
            .select(TrackRecord::as_select())
            .into_boxed();

        if let Some(ids) = &q.kit_ids {
            query = query.filter(kit_id.eq_any(ids.clone()));
        }
        if let Some(make) = &q.rid_make {
            query = query.filter(rid_make.eq(make.clone()));
        }
        if let Some(tt) = &q.track_type {
            query = query.filter(track_type.eq(tt.clone()));
        }

        let rows = if q.deduplicate {
            if let Some(cur) = cursor {
                query = query.filter(drone_id.gt(cur.drone_id.clone()));
            }
            query
                .order((drone_id.asc(), time.desc()))
                .distinct_on(drone_id)
                .limit(page_size)
                .load::<TrackRecord>(&mut conn)?
        } else {
            if let Some(cur) = cursor {
                query = query.filter(
                    time.lt(cur.time).or(time.eq(cur.time).and(
                        kit_id.gt(cur.kit_id.clone()).or(kit_id
                            .eq(cur.kit_id.clone())
                            .and(drone_id.gt(cur.drone_id.clone()))),
                    )),
                );
            }
            query
                .order((time.desc(), kit_id.asc(), drone_id.asc()))
                .limit(page_size)
                .load::<TrackRecord>(&mut conn)?
        };
        Ok(rows)
    }

    /// Ordered polyline for one drone, oldest first.
    pub fn history(
        &self,
        drone: &str,
        range: &TimeRange,
        limit_rows: i64,
    ) -> Result<Vec<TrackRecord>> {
        use crate::schema::tracks::dsl::*;
        let mut conn = self.conn()?;
        let rows = tracks
            .filter(drone_id.eq(drone))
            .filter(time.ge(range.start))
            .filter(time.le(range.end))
            .order(time.asc())
            .limit(limit_rows)
            .select(TrackRecord::as_select())
            .load::<TrackRecord>(&mut conn)?;
        Ok(rows)
    }

    /// Everything in a window, oldest first, for the pattern engine. The
    /// cap bounds memory on very busy fleets; pattern endpoints document
    /// the window rather than promising unbounded scans.
    pub fn in_window(&self, range: &TimeRange, cap: i64) -> Result<Vec<TrackRecord>> {
        use crate::schema::tracks::dsl::*;
        let mut conn = self.conn()?;
        let rows = tracks
            .filter(time.ge(range.start))
            .filter(time.le(range.end))
            .order(time.asc())
            .limit(cap)
            .select(TrackRecord::as_select())
            .load::<TrackRecord>(&mut conn)?;
        Ok(rows)
    }

    /// Observations of one drone around an instant that carry an RSSI,
    /// the estimator's input set.
    pub fn rssi_observations(
        &self,
        drone: &str,
        center: DateTime<Utc>,
        window_secs: i64,
    ) -> Result<Vec<TrackRecord>> {
        use crate::schema::tracks::dsl::*;
        let mut conn = self.conn()?;
        let half = chrono::Duration::seconds(window_secs);
        let rows = tracks
            .filter(drone_id.eq(drone))
            .filter(time.ge(center - half))
            .filter(time.le(center + half))
            .filter(rssi.is_not_null())
            .order(time.asc())
            .select(TrackRecord::as_select())
            .load::<TrackRecord>(&mut conn)?;
        Ok(rows)
    }

    /// Latest observation timestamp for a drone; anchors the estimator
    /// when the caller does not pass an explicit timestamp.
    pub fn latest_time(&self, drone: &str) -> Result<Option<DateTime<Utc>>> {
        use crate::schema::tracks::dsl::*;
        let mut conn = self.conn()?;
        let t = tracks
            .filter(drone_id.eq(drone))
            .select(diesel::dsl::max(time))
            .first::<Option<DateTime<Utc>>>(&mut conn)?;
        Ok(t)
    }
}
