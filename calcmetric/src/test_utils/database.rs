use secrecy::SecretString;
use tokio::runtime::Handle;
use tokio_postgres::{Client, NoTls};
use uuid::Uuid;

use crate::store::postgres::PgMetricStore;

/// Connection settings of the server hosting test databases.
///
/// Read from environment variables:
/// - `TESTS_DATABASE_HOST`: Postgres server hostname (required)
/// - `TESTS_DATABASE_PORT`: Postgres server port (required)
/// - `TESTS_DATABASE_USERNAME`: Database user (required)
/// - `TESTS_DATABASE_PASSWORD`: Database password (optional)
#[derive(Debug, Clone)]
pub struct TestServerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
}

impl TestServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("TESTS_DATABASE_HOST").expect("TESTS_DATABASE_HOST must be set"),
            port: std::env::var("TESTS_DATABASE_PORT")
                .expect("TESTS_DATABASE_PORT must be set")
                .parse()
                .expect("TESTS_DATABASE_PORT must be a valid port number"),
            username: std::env::var("TESTS_DATABASE_USERNAME")
                .expect("TESTS_DATABASE_USERNAME must be set"),
            password: std::env::var("TESTS_DATABASE_PASSWORD").ok(),
        }
    }

    /// Returns a connection string to `database`.
    pub fn connection_string(&self, database: &str) -> SecretString {
        let mut conn = format!(
            "host={} port={} user={} dbname={}",
            self.host, self.port, self.username, database
        );
        if let Some(password) = &self.password {
            conn.push_str(&format!(" password='{}'", password.replace('\'', "\\'")));
        }

        SecretString::new(conn)
    }

    async fn connect_admin(&self) -> Client {
        let conn = self.connection_string("postgres");
        let config = calcmetric_config::shared::connection_config(&conn, None)
            .expect("Failed to build the admin connection config");
        let (client, connection) = config
            .connect(NoTls)
            .await
            .expect("Failed to connect to Postgres");

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                eprintln!("warning: admin connection error: {e}");
            }
        });

        client
    }
}

/// A uniquely named database, dropped with its tables when this value is dropped.
///
/// Dropping requires a multi-threaded runtime, tests using it must run with
/// `#[tokio::test(flavor = "multi_thread")]`.
pub struct TestDatabase {
    pub server: TestServerConfig,
    pub name: String,
    store: Option<PgMetricStore>,
}

impl TestDatabase {
    /// Creates a new database on the test server and connects a store to it.
    pub async fn new() -> Self {
        let server = TestServerConfig::from_env();
        let name = Uuid::new_v4().to_string();

        let admin = server.connect_admin().await;
        admin
            .execute(&*format!(r#"create database "{name}";"#), &[])
            .await
            .expect("Failed to create database");

        let store = PgMetricStore::connect(&server.connection_string(&name))
            .await
            .expect("Failed to connect to the test database");

        Self {
            server,
            name,
            store: Some(store),
        }
    }

    pub fn store(&self) -> &PgMetricStore {
        self.store
            .as_ref()
            .expect("the store is only taken when the database is dropped")
    }

    /// Returns a connection string to this database.
    pub fn connection_string(&self) -> SecretString {
        self.server.connection_string(&self.name)
    }

    pub fn client(&self) -> &Client {
        self.store().client()
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        // Close our own connection before terminating the others.
        self.store.take();

        tokio::task::block_in_place(move || {
            Handle::current().block_on(async move { drop_database(&self.server, &self.name).await });
        });
    }
}

/// Drops `name` after terminating every connection to it.
pub async fn drop_database(server: &TestServerConfig, name: &str) {
    let client = server.connect_admin().await;

    if let Err(e) = client
        .execute(
            &*format!(
                r#"
                select pg_terminate_backend(pg_stat_activity.pid)
                from pg_stat_activity
                where pg_stat_activity.datname = '{name}'
                and pid <> pg_backend_pid();"#
            ),
            &[],
        )
        .await
    {
        eprintln!("warning: failed to terminate connections for database {name}: {e}");
    }

    if let Err(e) = client
        .execute(&*format!(r#"drop database if exists "{name}";"#), &[])
        .await
    {
        eprintln!("warning: failed to drop database {name}: {e}");
    }
}
