#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;

use modkit_rls::{DbRole, RlsDb, RlsError, SessionScope};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DbBackend, DbErr, MockDatabase, MockExecResult,
    Statement, Transaction, Value,
};

const PG: DbBackend = DbBackend::Postgres;

fn exec_ok(rows_affected: u64) -> MockExecResult {
    MockExecResult {
        last_insert_id: 0,
        rows_affected,
    }
}

fn editor_scope() -> SessionScope {
    SessionScope::new(
        Some("app.claims".to_owned()),
        r#"{"role":"editor"}"#.to_owned(),
        Some(DbRole::parse("editor").unwrap()),
    )
}

fn set_config(key: &str, payload: &str) -> Statement {
    Statement::from_sql_and_values(
        PG,
        "SELECT set_config($1, $2, true)",
        [key.into(), payload.into()],
    )
}

fn raw(sql: &str) -> Statement {
    Statement::from_string(PG, sql)
}

fn pool(db: MockDatabase) -> Arc<DatabaseConnection> {
    Arc::new(db.into_connection())
}

/// Statements recorded by the mock; every handle on the pool must be dropped first.
fn transaction_log(conn: Arc<DatabaseConnection>) -> Vec<Transaction> {
    Arc::try_unwrap(conn)
        .ok()
        .expect("pool still shared")
        .into_transaction_log()
}

#[tokio::test]
async fn bundles_context_statements_with_the_user_query() {
    let conn = pool(
        MockDatabase::new(PG)
            .append_exec_results([exec_ok(1), exec_ok(0)])
            .append_query_results([[BTreeMap::from([("title", Value::from("draft"))])]]),
    );
    let db = RlsDb::scoped(Arc::clone(&conn), editor_scope()).unwrap();

    let rows = db.query_all(raw("SELECT title FROM notes")).await.unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].try_get::<String>("", "title").unwrap(), "draft");
    drop(db);
    assert_eq!(
        transaction_log(conn),
        [Transaction::many([
            raw("BEGIN"),
            set_config("app.claims", r#"{"role":"editor"}"#),
            raw("SET LOCAL ROLE editor"),
            raw("SELECT title FROM notes"),
            raw("COMMIT"),
        ])]
    );
}

#[tokio::test]
async fn only_the_user_result_is_returned() {
    let conn = pool(
        MockDatabase::new(PG)
            .append_exec_results([exec_ok(1), exec_ok(0), exec_ok(7)]),
    );
    let db = RlsDb::scoped(conn, editor_scope()).unwrap();

    let res = db
        .execute(raw("UPDATE notes SET archived = true"))
        .await
        .unwrap();

    assert_eq!(res.rows_affected(), 7);
}

#[tokio::test]
async fn passthrough_adds_no_statements() {
    let conn = pool(
        MockDatabase::new(PG)
            .append_exec_results([exec_ok(3)]),
    );
    let db = RlsDb::passthrough(Arc::clone(&conn));

    let res = db.execute(raw("DELETE FROM drafts")).await.unwrap();

    assert_eq!(res.rows_affected(), 3);
    assert!(!db.is_scoped());
    drop(db);
    assert_eq!(
        transaction_log(conn),
        [Transaction::one(raw("DELETE FROM drafts"))]
    );
}

#[tokio::test]
async fn empty_scope_still_runs_in_a_transaction() {
    let conn = pool(
        MockDatabase::new(PG)
            .append_exec_results([exec_ok(1)]),
    );
    let scope = SessionScope::new(None, "{}".to_owned(), None);
    let db = RlsDb::scoped(Arc::clone(&conn), scope).unwrap();

    db.execute(raw("INSERT INTO audit DEFAULT VALUES"))
        .await
        .unwrap();

    drop(db);
    assert_eq!(
        transaction_log(conn),
        [Transaction::many([
            raw("BEGIN"),
            raw("INSERT INTO audit DEFAULT VALUES"),
            raw("COMMIT"),
        ])]
    );
}

#[tokio::test]
async fn failing_context_statement_rolls_back_the_bundle() {
    let conn = pool(
        MockDatabase::new(PG)
            .append_exec_errors([DbErr::Custom("permission denied to set role".to_owned())]),
    );
    let scope = SessionScope::new(None, "{}".to_owned(), Some(DbRole::parse("ghost").unwrap()));
    let db = RlsDb::scoped(Arc::clone(&conn), scope).unwrap();

    let err = db.execute(raw("DELETE FROM notes")).await.unwrap_err();

    assert!(err.to_string().contains("permission denied to set role"));
    drop(db);
    assert_eq!(
        transaction_log(conn),
        [Transaction::many([
            raw("BEGIN"),
            raw("SET LOCAL ROLE ghost"),
            raw("ROLLBACK"),
        ])]
    );
}

#[derive(Debug)]
enum AppError {
    #[allow(dead_code)]
    Db(DbErr),
    NotFound,
}

impl From<DbErr> for AppError {
    fn from(e: DbErr) -> Self {
        AppError::Db(e)
    }
}

#[tokio::test]
async fn caller_errors_are_returned_unchanged() {
    let conn = pool(
        MockDatabase::new(PG)
            .append_exec_results([exec_ok(1), exec_ok(0)])
            .append_query_results([Vec::<BTreeMap<&str, Value>>::new()]),
    );
    let db = RlsDb::scoped(Arc::clone(&conn), editor_scope()).unwrap();

    let res: Result<String, AppError> = db
        .run(|tx| {
            Box::pin(async move {
                let row = tx.query_one(raw("SELECT title FROM notes WHERE id = 1")).await?;
                let row = row.ok_or(AppError::NotFound)?;
                Ok(row.try_get::<String>("", "title")?)
            })
        })
        .await;

    assert!(matches!(res, Err(AppError::NotFound)));
    drop(db);
    let log = transaction_log(conn);
    assert_eq!(log.len(), 1);
    assert_eq!(
        log[0],
        Transaction::many([
            raw("BEGIN"),
            set_config("app.claims", r#"{"role":"editor"}"#),
            raw("SET LOCAL ROLE editor"),
            raw("SELECT title FROM notes WHERE id = 1"),
            raw("ROLLBACK"),
        ])
    );
}

#[tokio::test]
async fn each_operation_is_its_own_bundle() {
    let conn = pool(
        MockDatabase::new(PG)
            .append_exec_results([
            exec_ok(1),
            exec_ok(0),
            exec_ok(1),
            exec_ok(1),
            exec_ok(0),
            exec_ok(1),
        ]),
    );
    let db = RlsDb::scoped(Arc::clone(&conn), editor_scope()).unwrap();

    db.execute(raw("UPDATE a SET x = 1")).await.unwrap();
    db.execute(raw("UPDATE b SET y = 2")).await.unwrap();

    drop(db);
    let log = transaction_log(conn);
    assert_eq!(log.len(), 2);
    assert_eq!(
        log[1],
        Transaction::many([
            raw("BEGIN"),
            set_config("app.claims", r#"{"role":"editor"}"#),
            raw("SET LOCAL ROLE editor"),
            raw("UPDATE b SET y = 2"),
            raw("COMMIT"),
        ])
    );
}

#[tokio::test]
async fn scoping_requires_postgres() {
    let conn = pool(MockDatabase::new(DbBackend::Sqlite));

    let err = RlsDb::scoped(Arc::clone(&conn), editor_scope()).unwrap_err();

    assert!(matches!(err, RlsError::UnsupportedBackend("sqlite")));
    assert!(transaction_log(conn).is_empty());
}

#[tokio::test]
async fn cloned_handles_share_one_pool() {
    let conn = pool(MockDatabase::new(PG).append_exec_results([
        exec_ok(1),
        exec_ok(0),
        exec_ok(1),
        exec_ok(1),
        exec_ok(0),
        exec_ok(1),
    ]));
    let db = RlsDb::scoped(Arc::clone(&conn), editor_scope()).unwrap();
    let copy = db.clone();

    assert_eq!(Arc::strong_count(&conn), 3);
    db.execute(raw("UPDATE a SET x = 1")).await.unwrap();
    copy.execute(raw("UPDATE b SET y = 2")).await.unwrap();

    drop(db);
    drop(copy);
    let log = transaction_log(conn);
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].statements()[3], raw("UPDATE a SET x = 1"));
    assert_eq!(log[1].statements()[3], raw("UPDATE b SET y = 2"));
}

#[tokio::test]
async fn runner_reports_whether_it_is_scoped() {
    let conn = pool(MockDatabase::new(PG).append_exec_results([exec_ok(1), exec_ok(0)]));
    let scoped = RlsDb::scoped(Arc::clone(&conn), editor_scope()).unwrap();
    let plain = RlsDb::passthrough(Arc::clone(&conn));

    let inside: Result<bool, DbErr> = scoped
        .run(|tx| Box::pin(async move { Ok(tx.is_scoped()) }))
        .await;
    let outside: Result<bool, DbErr> = plain
        .run(|tx| Box::pin(async move { Ok(tx.is_scoped()) }))
        .await;

    assert!(inside.unwrap());
    assert!(!outside.unwrap());
}
