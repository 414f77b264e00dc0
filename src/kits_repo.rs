use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{Bool, Nullable, Text, Timestamptz};
use tracing::debug;

use crate::db::{PgPool, PgPooledConnection};
use crate::kits::{Kit, KitSource, KitStatus, KitUpsert, NewKit};

/// Partial update applied by the admin API. `None` leaves a column
/// untouched; `source` merges through the lattice and `enabled` also
/// drives the `disabled_by_admin` tombstone flag.
#[derive(Debug, Clone, Default)]
pub struct KitAdminUpdate {
    pub name: Option<String>,
    pub location: Option<String>,
    pub api_url: Option<String>,
    pub source: Option<KitSource>,
    pub enabled: Option<bool>,
}

#[derive(Clone)]
pub struct KitsRepository {
    pool: PgPool,
}

impl KitsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PgPooledConnection> {
        self.pool.get().context("getting registry connection")
    }

    pub fn get_all(&self) -> Result<Vec<Kit>> {
        use crate::schema::kits::dsl::*;
        let mut conn = self.conn()?;
        let rows = kits
            .select(Kit::as_select())
            .order(kit_id.asc())
            .load::<Kit>(&mut conn)?;
        Ok(rows)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Kit>> {
        use crate::schema::kits::dsl::*;
        let mut conn = self.conn()?;
        let row = kits
            .filter(kit_id.eq(id))
            .select(Kit::as_select())
            .first::<Kit>(&mut conn)
            .optional()?;
        Ok(row)
    }

    /// Admin create. Returns `None` when the kit id already exists so the
    /// handler can answer 409.
    pub fn insert(&self, new_kit: &NewKit) -> Result<Option<Kit>> {
        use crate::schema::kits::dsl::*;
        let mut conn = self.conn()?;
        let inserted = diesel::insert_into(kits)
            .values(new_kit)
            .on_conflict_do_nothing()
            .returning(Kit::as_returning())
            .get_result::<Kit>(&mut conn)
            .optional()?;
        Ok(inserted)
    }

    /// Config seeding: add-if-missing only. Existing rows, including
    /// admin-disabled tombstones, are never touched. Returns whether a
    /// row was created.
    pub fn seed(&self, new_kit: &NewKit) -> Result<bool> {
        use crate::schema::kits::dsl::*;
        let mut conn = self.conn()?;
        let n = diesel::insert_into(kits)
            .values(new_kit)
            .on_conflict_do_nothing()
            .execute(&mut conn)?;
        Ok(n > 0)
    }

    /// Insert-or-update with last-writer-wins on provided fields. The
    /// source column follows the monotone lattice (`http ∨ mqtt = both`,
    /// `both` is absorbing) and auto-registration can never re-enable a
    /// kit the admin tombstoned.
    pub fn upsert(&self, req: &KitUpsert) -> Result<()> {
        let mut conn = self.conn()?;
        diesel::sql_query(
            r#"
            INSERT INTO kits (kit_id, name, location, api_url, source, enabled)
            VALUES ($1, COALESCE($2, $1), $3, $4, $5, COALESCE($6, TRUE))
            ON CONFLICT (kit_id) DO UPDATE SET
                name = COALESCE($2, kits.name),
                location = COALESCE($3, kits.location),
                api_url = COALESCE($4, kits.api_url),
                source = CASE
                    WHEN kits.source = 'both' OR kits.source <> EXCLUDED.source
                        THEN 'both'::kit_source
                    ELSE kits.source
                END,
                enabled = CASE
                    WHEN kits.disabled_by_admin THEN kits.enabled
                    ELSE COALESCE($6, kits.enabled)
                END,
                updated_at = now()
            "#,
        )
        .bind::<Text, _>(&req.kit_id)
        .bind::<Nullable<Text>, _>(&req.name)
        .bind::<Nullable<Text>, _>(&req.location)
        .bind::<Nullable<Text>, _>(&req.api_url)
        .bind::<crate::schema::sql_types::KitSource, _>(req.source)
        .bind::<Nullable<Bool>, _>(req.enabled)
        .execute(&mut conn)
        .with_context(|| format!("upserting kit {}", req.kit_id))?;
        Ok(())
    }

    /// Advance `last_seen`, but only forward.
    pub fn touch(&self, id: &str, seen_at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn()?;
        diesel::sql_query(
            r#"
            UPDATE kits
            SET last_seen = $2, updated_at = now()
            WHERE kit_id = $1 AND (last_seen IS NULL OR last_seen < $2)
            "#,
        )
        .bind::<Text, _>(id)
        .bind::<Timestamptz, _>(seen_at)
        .execute(&mut conn)?;
        Ok(())
    }

    /// Admin partial update. Returns the updated row, or `None` for an
    /// unknown kit id.
    pub fn admin_update(&self, id: &str, update: &KitAdminUpdate) -> Result<Option<Kit>> {
        let mut conn = self.conn()?;
        let row = diesel::sql_query(
            r#"
            UPDATE kits SET
                name = COALESCE($2, name),
                location = COALESCE($3, location),
                api_url = COALESCE($4, api_url),
                source = CASE
                    WHEN $5::kit_source IS NULL THEN source
                    WHEN source = 'both' OR source <> $5::kit_source THEN 'both'::kit_source
                    ELSE source
                END,
                enabled = COALESCE($6, enabled),
                disabled_by_admin = CASE
                    WHEN $6 IS NOT DISTINCT FROM TRUE THEN FALSE
                    WHEN $6 IS NOT DISTINCT FROM FALSE THEN TRUE
                    ELSE disabled_by_admin
                END,
                updated_at = now()
            WHERE kit_id = $1
            RETURNING *
            "#,
        )
        .bind::<Text, _>(id)
        .bind::<Nullable<Text>, _>(&update.name)
        .bind::<Nullable<Text>, _>(&update.location)
        .bind::<Nullable<Text>, _>(&update.api_url)
        .bind::<Nullable<crate::schema::sql_types::KitSource>, _>(update.source)
        .bind::<Nullable<Bool>, _>(update.enabled)
        .get_result::<Kit>(&mut conn)
        .optional()
        .with_context(|| format!("updating kit {id}"))?;
        Ok(row)
    }

    /// Admin removal. The row becomes a disabled tombstone that config
    /// seeding cannot resurrect; telemetry is purged only when asked.
    /// Returns `false` for an unknown kit id.
    pub fn admin_delete(&self, id: &str, delete_data: bool) -> Result<bool> {
        let mut conn = self.conn()?;
        let tombstoned = {
            use crate::schema::kits::dsl::*;
            diesel::update(kits.filter(kit_id.eq(id)))
                .set((
                    enabled.eq(false),
                    disabled_by_admin.eq(true),
                    updated_at.eq(diesel::dsl::now),
                ))
                .execute(&mut conn)?
        };
        if tombstoned == 0 {
            return Ok(false);
        }

        if delete_data {
            let t = diesel::delete(
                crate::schema::tracks::table.filter(crate::schema::tracks::kit_id.eq(id)),
            )
            .execute(&mut conn)?;
            let s = diesel::delete(
                crate::schema::signals::table.filter(crate::schema::signals::kit_id.eq(id)),
            )
            .execute(&mut conn)?;
            let h = diesel::delete(
                crate::schema::kit_health::table.filter(crate::schema::kit_health::kit_id.eq(id)),
            )
            .execute(&mut conn)?;
            debug!("Purged telemetry for {id}: {t} tracks, {s} signals, {h} health samples");
        }
        Ok(true)
    }

    /// Supervisor status rollup: persist only when the classification
    /// actually changed. Returns the number of rows touched.
    pub fn set_status(&self, id: &str, new_status: KitStatus) -> Result<usize> {
        use crate::schema::kits::dsl::*;
        let mut conn = self.conn()?;
        let n = diesel::update(kits.filter(kit_id.eq(id).and(status.ne(new_status))))
            .set((status.eq(new_status), updated_at.eq(diesel::dsl::now)))
            .execute(&mut conn)?;
        Ok(n)
    }
}
