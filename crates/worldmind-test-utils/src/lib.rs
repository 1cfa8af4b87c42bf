//! Per-test PostgreSQL provisioning for integration suites.
//!
//! One PostgreSQL server is shared by every test in a binary; each test
//! provisions its own database inside it with [`TestDb::provision`] and
//! removes it again with [`TestDb::teardown`]. Point
//! `WORLDMIND_TEST_PG_URL` at an already-running server (the CI setup
//! script does) to skip the testcontainers launch entirely.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use worldmind_db::pool::bootstrap_schema;

/// Environment variable naming an external server root URL (no database
/// path) to use instead of a container.
pub const EXTERNAL_URL_VAR: &str = "WORLDMIND_TEST_PG_URL";

/// What keeps the shared server alive for the duration of the binary.
enum Backing {
    /// Externally managed; nothing to hold.
    External,
    /// Container handle; dropping it would stop the server.
    Container(#[allow(dead_code)] ContainerAsync<Postgres>),
}

struct PgServer {
    /// Server root URL without a database path.
    root_url: String,
    _backing: Backing,
}

static SERVER: OnceCell<PgServer> = OnceCell::const_new();

async fn server() -> &'static PgServer {
    SERVER.get_or_init(launch_server).await
}

async fn launch_server() -> PgServer {
    if let Ok(url) = std::env::var(EXTERNAL_URL_VAR) {
        return PgServer {
            root_url: url.trim_end_matches('/').to_owned(),
            _backing: Backing::External,
        };
    }

    let container = Postgres::default()
        .with_tag("18")
        .start()
        .await
        .expect("postgres test container failed to start");

    let host = container
        .get_host()
        .await
        .expect("container host unavailable");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("container port mapping unavailable");

    PgServer {
        root_url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _backing: Backing::Container(container),
    }
}

/// Open a connection to the shared server's admin database.
async fn admin_connection() -> PgConnection {
    let root = &server().await.root_url;
    PgConnection::connect(&format!("{root}/postgres"))
        .await
        .expect("failed to connect to admin database")
}

/// A provisioned throwaway database with the checkpoint schema applied.
///
/// Each instance owns one uniquely-named database. Call
/// [`TestDb::teardown`] at the end of the test; a leaked database only
/// lives as long as the shared server.
pub struct TestDb {
    pool: PgPool,
    name: String,
}

impl TestDb {
    /// Create a fresh database on the shared server and connect a pool to
    /// it with the schema bootstrapped.
    pub async fn provision() -> Self {
        let name = format!("wm_test_{}", Uuid::new_v4().simple());

        let mut admin = admin_connection().await;
        sqlx::query(&format!("CREATE DATABASE {name}"))
            .execute(&mut admin)
            .await
            .unwrap_or_else(|e| panic!("CREATE DATABASE {name} failed: {e}"));
        let _ = admin.close().await;

        let url = format!("{}/{name}", server().await.root_url);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to {name}: {e}"));

        bootstrap_schema(&pool)
            .await
            .expect("checkpoint schema bootstrap failed");

        Self { pool, name }
    }

    /// The pool connected to this test's database.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// This database's generated name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the pool and drop the database.
    ///
    /// Uses `DROP DATABASE ... WITH (FORCE)` so stray connections cannot
    /// keep the database alive; failures are reported but not fatal, since
    /// the shared server dies with the test binary anyway.
    pub async fn teardown(self) {
        let Self { pool, name } = self;
        pool.close().await;

        let mut admin = admin_connection().await;
        let drop = format!("DROP DATABASE IF EXISTS {name} WITH (FORCE)");
        if let Err(e) = sqlx::query(&drop).execute(&mut admin).await {
            eprintln!("warning: failed to drop test database {name}: {e}");
        }
        let _ = admin.close().await;
    }
}
