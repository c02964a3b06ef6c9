//! Process-wide database client.
//!
//! The pool handle is created lazily on first use and then shared by all
//! requests for the lifetime of the process. Concurrent first requests wait
//! on the same initializer, so exactly one pool is ever created.

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr};
use tokio::sync::OnceCell;

use crate::errors::RlsError;
use crate::role::DbRole;

/// Creates the underlying pool handle.
#[async_trait]
pub trait DbConnector: Send + Sync {
    async fn connect(&self) -> Result<DatabaseConnection, DbErr>;
}

/// Connects through `SeaORM` using the given connect options.
#[derive(Debug, Clone)]
pub struct UrlConnector {
    options: ConnectOptions,
}

impl UrlConnector {
    #[must_use]
    pub fn new(options: ConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl DbConnector for UrlConnector {
    async fn connect(&self) -> Result<DatabaseConnection, DbErr> {
        Database::connect(self.options.clone()).await
    }
}

/// Lazily created, process-wide database client.
///
/// The pool handle is shared as `Arc<DatabaseConnection>`; every request
/// handle holds a reference to the same pool.
pub struct ProcessClient {
    connector: Option<Arc<dyn DbConnector>>,
    startup_role: Option<DbRole>,
    conn: OnceCell<Arc<DatabaseConnection>>,
}

impl std::fmt::Debug for ProcessClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessClient")
            .field("startup_role", &self.startup_role)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl ProcessClient {
    /// `startup_role`, when set, is applied once with `SET ROLE` right after
    /// the pool is created.
    #[must_use]
    pub fn new(connector: Arc<dyn DbConnector>, startup_role: Option<DbRole>) -> Self {
        Self {
            connector: Some(connector),
            startup_role,
            conn: OnceCell::new(),
        }
    }

    /// Wrap an already connected pool.
    #[must_use]
    pub fn from_connection(conn: Arc<DatabaseConnection>) -> Self {
        Self {
            connector: None,
            startup_role: None,
            conn: OnceCell::new_with(Some(conn)),
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.conn.initialized()
    }

    /// Get the pool handle, connecting on first use.
    ///
    /// A failed attempt leaves the client uninitialized; the next call retries.
    ///
    /// # Errors
    /// Returns [`RlsError::Connect`] if the pool cannot be created.
    pub async fn get(&self) -> Result<&Arc<DatabaseConnection>, RlsError> {
        self.conn
            .get_or_try_init(|| self.create())
            .await
            .map_err(RlsError::Connect)
    }

    async fn create(&self) -> Result<Arc<DatabaseConnection>, DbErr> {
        let Some(connector) = &self.connector else {
            return Err(DbErr::Custom("no database connector configured".to_owned()));
        };
        let conn = connector.connect().await?;
        tracing::info!(
            backend = ?conn.get_database_backend(),
            "database client created"
        );

        if let Some(role) = &self.startup_role {
            apply_startup_role(&conn, role).await;
        }
        Ok(Arc::new(conn))
    }
}

/// Best-effort `SET ROLE` on a freshly created pool.
///
/// Runs outside any transaction and reaches a single pooled connection only,
/// so it is advisory. Failures are logged and ignored.
async fn apply_startup_role(conn: &DatabaseConnection, role: &DbRole) {
    if conn.get_database_backend() != DbBackend::Postgres {
        tracing::warn!(%role, "startup role skipped: backend has no roles");
        return;
    }
    match conn.execute_unprepared(&format!("SET ROLE {role}")).await {
        Ok(_) => tracing::debug!(%role, "startup role applied"),
        Err(e) => tracing::warn!(%role, error = %e, "startup role not applied"),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use sea_orm::{MockDatabase, MockExecResult, Statement, Transaction};
    use tracing_test::traced_test;

    struct Mock(DbBackend, bool);

    #[async_trait]
    impl DbConnector for Mock {
        async fn connect(&self) -> Result<DatabaseConnection, DbErr> {
            let db = MockDatabase::new(self.0);
            let db = if self.1 {
                db.append_exec_results([MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 0,
                }])
            } else {
                db.append_exec_errors([DbErr::Custom("role \"anon\" does not exist".to_owned())])
            };
            Ok(db.into_connection())
        }
    }

    fn anon() -> Option<DbRole> {
        Some(DbRole::parse("anon").unwrap())
    }

    /// Drain the mock log once `client` is the last other owner of the pool.
    fn drain(client: ProcessClient, conn: Arc<DatabaseConnection>) -> Vec<Transaction> {
        drop(client);
        Arc::try_unwrap(conn)
            .ok()
            .expect("pool still shared")
            .into_transaction_log()
    }

    #[tokio::test]
    #[traced_test]
    async fn startup_role_is_applied_once() {
        let client = ProcessClient::new(Arc::new(Mock(DbBackend::Postgres, true)), anon());

        let conn = Arc::clone(client.get().await.unwrap());
        client.get().await.unwrap();

        assert_eq!(
            drain(client, conn),
            [Transaction::one(Statement::from_string(
                DbBackend::Postgres,
                "SET ROLE anon"
            ))]
        );
        assert!(logs_contain("startup role applied"));
    }

    #[tokio::test]
    #[traced_test]
    async fn startup_role_failure_is_not_fatal() {
        let client = ProcessClient::new(Arc::new(Mock(DbBackend::Postgres, false)), anon());

        assert!(client.get().await.is_ok());
        assert!(client.is_initialized());
        assert!(logs_contain("startup role not applied"));
    }

    #[tokio::test]
    #[traced_test]
    async fn startup_role_is_skipped_without_roles() {
        let client = ProcessClient::new(Arc::new(Mock(DbBackend::Sqlite, true)), anon());

        let conn = Arc::clone(client.get().await.unwrap());

        assert!(drain(client, conn).is_empty());
        assert!(logs_contain("startup role skipped"));
    }

    #[tokio::test]
    async fn no_startup_role_sends_nothing() {
        let client = ProcessClient::new(Arc::new(Mock(DbBackend::Postgres, true)), None);

        let conn = Arc::clone(client.get().await.unwrap());

        assert!(drain(client, conn).is_empty());
    }

    #[tokio::test]
    async fn wrapped_connection_is_shared_not_reconnected() {
        let conn = Arc::new(MockDatabase::new(DbBackend::Postgres).into_connection());
        let client = ProcessClient::from_connection(Arc::clone(&conn));

        assert!(client.is_initialized());
        assert!(Arc::ptr_eq(client.get().await.unwrap(), &conn));
    }
}
