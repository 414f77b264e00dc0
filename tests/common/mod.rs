//! Shared harness for store-backed integration tests.
//!
//! Each test gets its own database, created from the server pointed at by
//! `TEST_DATABASE_URL` and dropped again on `Drop`. The tests skip
//! silently when that variable is unset, so the suite runs without a
//! TimescaleDB instance (the pure-logic coverage lives in the unit tests).

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::MigrationHarness;
use uuid::Uuid;

use dragnet::db::{MIGRATIONS, PgPool};

pub struct TestDatabase {
    admin_url: String,
    db_name: String,
    pool: PgPool,
}

impl TestDatabase {
    /// Create an isolated database with migrations applied, or `None`
    /// when `TEST_DATABASE_URL` is not configured.
    pub fn new() -> Option<Self> {
        let admin_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let db_name = format!("dragnet_test_{}", Uuid::new_v4().simple());

        let mut admin_conn = PgConnection::establish(&admin_url)
            .expect("connecting to TEST_DATABASE_URL");
        diesel::sql_query(format!(r#"CREATE DATABASE "{db_name}""#))
            .execute(&mut admin_conn)
            .expect("creating test database");

        let test_url = replace_db_name(&admin_url, &db_name);
        let mut conn =
            PgConnection::establish(&test_url).expect("connecting to test database");
        diesel::sql_query("CREATE EXTENSION IF NOT EXISTS timescaledb")
            .execute(&mut conn)
            .expect("creating timescaledb extension");
        conn.run_pending_migrations(MIGRATIONS)
            .expect("applying migrations");

        let manager = ConnectionManager::<PgConnection>::new(test_url);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .expect("building test pool");

        Some(Self {
            admin_url,
            db_name,
            pool,
        })
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        if let Ok(mut conn) = PgConnection::establish(&self.admin_url) {
            let _ = diesel::sql_query(format!(
                r#"DROP DATABASE IF EXISTS "{}" WITH (FORCE)"#,
                self.db_name
            ))
            .execute(&mut conn);
        }
    }
}

fn replace_db_name(url: &str, db_name: &str) -> String {
    match url.rsplit_once('/') {
        Some((base, last)) if !last.contains('@') => format!("{base}/{db_name}"),
        _ => format!("{url}/{db_name}"),
    }
}
