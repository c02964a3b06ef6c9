//! Context-scoped database access.
//!
//! A pooled client may hand consecutive statements to different physical
//! connections, so session settings issued "before" a query are not
//! guaranteed to be visible to it. [`RlsDb`] therefore runs every operation
//! as one transaction:
//!
//! ```text
//! BEGIN
//! SELECT set_config($1, $2, true)   -- if a session config key is configured
//! SET LOCAL ROLE <role>             -- if a role was resolved
//! <the caller's operation>
//! COMMIT                            -- or ROLLBACK on any error
//! ```
//!
//! Both settings are transaction-local and vanish at `COMMIT`/`ROLLBACK`, so
//! nothing leaks to the next user of the connection.
//!
//! # Example
//!
//! ```ignore
//! async fn list_notes(Rls(db): Rls) -> Result<Json<Vec<note::Model>>, AppError> {
//!     let notes = db
//!         .run(|conn| Box::pin(async move { note::Entity::find().all(conn).await }))
//!         .await?;
//!     Ok(Json(notes))
//! }
//! ```

use std::{future::Future, pin::Pin, sync::Arc};

use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr, ExecResult,
    QueryResult, Statement, TransactionTrait,
};

use crate::config::ModuleConfig;
use crate::context::SecurityContext;
use crate::errors::RlsError;
use crate::role::DbRole;

/// Session settings applied in front of every operation of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionScope {
    config_key: Option<String>,
    claims_payload: String,
    role: Option<DbRole>,
}

impl SessionScope {
    #[must_use]
    pub fn new(config_key: Option<String>, claims_payload: String, role: Option<DbRole>) -> Self {
        Self {
            config_key,
            claims_payload,
            role,
        }
    }

    /// Build the scope of a request from its security context.
    #[must_use]
    pub fn from_context(config: &ModuleConfig, ctx: SecurityContext) -> Self {
        let (claims_payload, role) = ctx.into_session_parts();
        Self::new(config.session_config_key.clone(), claims_payload, role)
    }

    #[must_use]
    pub fn role(&self) -> Option<&DbRole> {
        self.role.as_ref()
    }

    #[must_use]
    pub fn claims_payload(&self) -> &str {
        &self.claims_payload
    }

    /// Context statements, in execution order.
    ///
    /// The claims payload and the key are bound parameters. The role is
    /// interpolated, which is sound only because [`DbRole`] is validated.
    #[must_use]
    pub fn statements(&self, backend: DbBackend) -> Vec<Statement> {
        let mut stmts = Vec::with_capacity(2);
        if let Some(key) = &self.config_key {
            stmts.push(Statement::from_sql_and_values(
                backend,
                "SELECT set_config($1, $2, true)",
                [key.clone().into(), self.claims_payload.clone().into()],
            ));
        }
        if let Some(role) = &self.role {
            stmts.push(Statement::from_string(
                backend,
                format!("SET LOCAL ROLE {role}"),
            ));
        }
        stmts
    }
}

/// Executor handed to operations run through [`RlsDb::run`].
///
/// Implements [`ConnectionTrait`], so it can be passed to any `SeaORM` query
/// (`Entity::find().all(runner)`, `Statement` execution, ...). The pool or
/// transaction behind it is not reachable otherwise.
pub struct RlsRunner<'a> {
    inner: Runner<'a>,
}

enum Runner<'a> {
    Conn(&'a DatabaseConnection),
    Tx(&'a DatabaseTransaction),
}

impl<'a> RlsRunner<'a> {
    fn conn(conn: &'a DatabaseConnection) -> Self {
        Self {
            inner: Runner::Conn(conn),
        }
    }

    fn tx(txn: &'a DatabaseTransaction) -> Self {
        Self {
            inner: Runner::Tx(txn),
        }
    }

    /// Whether the operation runs inside a scoped transaction.
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        matches!(self.inner, Runner::Tx(_))
    }
}

impl std::fmt::Debug for RlsRunner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner {
            Runner::Conn(_) => f.write_str("RlsRunner::Conn"),
            Runner::Tx(_) => f.write_str("RlsRunner::Tx"),
        }
    }
}

#[async_trait::async_trait]
impl ConnectionTrait for RlsRunner<'_> {
    fn get_database_backend(&self) -> DbBackend {
        match self.inner {
            Runner::Conn(c) => c.get_database_backend(),
            Runner::Tx(t) => t.get_database_backend(),
        }
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        match self.inner {
            Runner::Conn(c) => c.execute(stmt).await,
            Runner::Tx(t) => t.execute(stmt).await,
        }
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        match self.inner {
            Runner::Conn(c) => c.execute_unprepared(sql).await,
            Runner::Tx(t) => t.execute_unprepared(sql).await,
        }
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        match self.inner {
            Runner::Conn(c) => c.query_one(stmt).await,
            Runner::Tx(t) => t.query_one(stmt).await,
        }
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        match self.inner {
            Runner::Conn(c) => c.query_all(stmt).await,
            Runner::Tx(t) => t.query_all(stmt).await,
        }
    }

    fn support_returning(&self) -> bool {
        match self.inner {
            Runner::Conn(c) => c.support_returning(),
            Runner::Tx(t) => t.support_returning(),
        }
    }

    fn is_mock_connection(&self) -> bool {
        match self.inner {
            Runner::Conn(c) => c.is_mock_connection(),
            Runner::Tx(t) => t.is_mock_connection(),
        }
    }
}

/// Request-scoped database handle published by the RLS middleware.
///
/// Either a plain pass-through to the process client, or a scoped handle
/// that wraps every operation with the request's session settings. Clones
/// share the same pool.
#[derive(Clone)]
pub struct RlsDb {
    conn: Arc<DatabaseConnection>,
    scope: Option<Arc<SessionScope>>,
}

impl std::fmt::Debug for RlsDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RlsDb")
            .field("engine", &self.db_engine())
            .field("role", &self.role())
            .field("scoped", &self.is_scoped())
            .finish_non_exhaustive()
    }
}

impl RlsDb {
    /// Handle that runs operations directly on the pool, with no extra statements.
    #[must_use]
    pub fn passthrough(conn: Arc<DatabaseConnection>) -> Self {
        Self { conn, scope: None }
    }

    /// Handle that wraps every operation with `scope`.
    ///
    /// # Errors
    /// Returns [`RlsError::UnsupportedBackend`] unless the pool is `PostgreSQL`.
    pub fn scoped(conn: Arc<DatabaseConnection>, scope: SessionScope) -> Result<Self, RlsError> {
        match conn.get_database_backend() {
            DbBackend::Postgres => Ok(Self {
                conn,
                scope: Some(Arc::new(scope)),
            }),
            other => Err(RlsError::UnsupportedBackend(backend_name(other))),
        }
    }

    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    /// Role applied to this request's operations, if any.
    #[must_use]
    pub fn role(&self) -> Option<&DbRole> {
        self.scope.as_deref().and_then(SessionScope::role)
    }

    #[must_use]
    pub fn scope(&self) -> Option<&SessionScope> {
        self.scope.as_deref()
    }

    /// Return database engine identifier for logging/tracing.
    #[must_use]
    pub fn db_engine(&self) -> &'static str {
        backend_name(self.conn.get_database_backend())
    }

    /// Run one logical operation.
    ///
    /// Scoped handles execute the context statements and `f` in a single
    /// transaction and return only `f`'s result. Any failure (begin, context
    /// statement, `f`, commit) rolls the whole bundle back and is returned
    /// unchanged; nothing is retried.
    ///
    /// # Errors
    /// Returns `f`'s error, or a `DbErr` converted into `E`.
    pub async fn run<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a RlsRunner<'a>) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>
            + Send,
        T: Send,
        E: From<DbErr> + Send,
    {
        let Some(scope) = self.scope.as_deref() else {
            let runner = RlsRunner::conn(&self.conn);
            return f(&runner).await;
        };

        let prelude = scope.statements(self.conn.get_database_backend());
        tracing::trace!(
            statements = prelude.len(),
            role = ?scope.role().map(DbRole::as_str),
            "running scoped operation"
        );

        let txn = self.conn.begin().await.map_err(E::from)?;
        let runner = RlsRunner::tx(&txn);

        let res: Result<T, E> = async {
            for stmt in prelude {
                txn.execute(stmt).await.map_err(E::from)?;
            }
            f(&runner).await
        }
        .await;

        match res {
            Ok(v) => {
                txn.commit().await.map_err(E::from)?;
                Ok(v)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    tracing::debug!(error = %rollback_err, "rollback of scoped operation failed");
                }
                Err(e)
            }
        }
    }

    /// Execute a statement as one wrapped operation.
    ///
    /// # Errors
    /// Returns the database error of any statement in the bundle.
    pub async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        self.run(move |db| Box::pin(async move { db.execute(stmt).await }))
            .await
    }

    /// Query at most one row as one wrapped operation.
    ///
    /// # Errors
    /// Returns the database error of any statement in the bundle.
    pub async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        self.run(move |db| Box::pin(async move { db.query_one(stmt).await }))
            .await
    }

    /// Query all rows as one wrapped operation.
    ///
    /// # Errors
    /// Returns the database error of any statement in the bundle.
    pub async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        self.run(move |db| Box::pin(async move { db.query_all(stmt).await }))
            .await
    }
}

fn backend_name(backend: DbBackend) -> &'static str {
    match backend {
        DbBackend::Postgres => "postgres",
        DbBackend::MySql => "mysql",
        DbBackend::Sqlite => "sqlite",
    }
}
