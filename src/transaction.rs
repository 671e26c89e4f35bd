//! Transactions bound to one leased connection.
//!
//! A `Transaction` is handed to the body of `Client::transaction`. The
//! surrounding retry loop owns its lifecycle: it starts the transaction,
//! commits or rolls back when the body returns, and releases the holder.
//! Queries on the handle run strictly one at a time.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::client::{json_text, required, required_single};
use crate::codec::{QueryArgs, Value};
use crate::error::{Error, ErrorKind, Result};
use crate::options::Options;
use crate::pool::ConnectionHolder;
use crate::wire::{Cardinality, OutputFormat, QueryRequest, RawConnection, TransactionStatus};

const IN_PROGRESS: &str =
    "Another query is in progress. Use the query methods on 'Client' to run queries concurrently.";
const IN_PROGRESS_AT_EXIT: &str =
    "A query is still in progress after transaction block has returned.";

/// Lifecycle of a transaction. Everything but `Active` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    Failed,
}

struct Shared {
    /// `None` once the surrounding block has released the connection.
    conn: tokio::sync::Mutex<Option<ConnectionHolder>>,
    state: Mutex<TransactionState>,
    options: Options,
}

/// Handle on a running transaction.
#[derive(Clone)]
pub struct Transaction {
    shared: Arc<Shared>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state())
            .finish()
    }
}

impl Transaction {
    /// Reset the connection and send the start statement.
    ///
    /// On failure the holder is released before the error is returned.
    pub(crate) async fn start(mut holder: ConnectionHolder, options: Options) -> Result<Self> {
        if let Err(e) = Self::begin(&mut holder, &options).await {
            holder.release().await;
            return Err(e);
        }
        Ok(Self {
            shared: Arc::new(Shared {
                conn: tokio::sync::Mutex::new(Some(holder)),
                state: Mutex::new(TransactionState::Active),
                options,
            }),
        })
    }

    async fn begin(holder: &mut ConnectionHolder, options: &Options) -> Result<()> {
        let conn = holder.connection().await?;
        conn.reset_state().await?;
        let statement = options.transaction.start_statement();
        let args = QueryArgs::None;
        let req = control_request(&statement, &args, options);
        conn.fetch(&req).await?;
        debug!(statement = %statement, "transaction started");
        Ok(())
    }

    pub fn state(&self) -> TransactionState {
        *self.shared.state.lock()
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    // ========================================================================
    // Query surface
    // ========================================================================

    /// Run a statement, discarding any result.
    pub async fn execute(&self, query: &str, args: impl Into<QueryArgs>) -> Result<()> {
        self.run(
            "execute",
            query,
            &args.into(),
            OutputFormat::None,
            Cardinality::NoResult,
        )
        .await
        .map(|_| ())
    }

    pub async fn query(&self, query: &str, args: impl Into<QueryArgs>) -> Result<Vec<Value>> {
        self.run(
            "query",
            query,
            &args.into(),
            OutputFormat::Binary,
            Cardinality::Many,
        )
        .await
    }

    pub async fn query_single(
        &self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> Result<Option<Value>> {
        let rows = self
            .run(
                "query",
                query,
                &args.into(),
                OutputFormat::Binary,
                Cardinality::AtMostOne,
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    pub async fn query_required(
        &self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> Result<Vec<Value>> {
        let rows = self
            .run(
                "query",
                query,
                &args.into(),
                OutputFormat::Binary,
                Cardinality::AtLeastOne,
            )
            .await?;
        required(rows, query)
    }

    pub async fn query_required_single(
        &self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> Result<Value> {
        let rows = self
            .run(
                "query",
                query,
                &args.into(),
                OutputFormat::Binary,
                Cardinality::One,
            )
            .await?;
        required_single(rows, query)
    }

    pub async fn query_json(&self, query: &str, args: impl Into<QueryArgs>) -> Result<String> {
        self.json("query", query, args.into(), Cardinality::Many)
            .await
    }

    pub async fn query_single_json(
        &self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> Result<String> {
        self.json("query", query, args.into(), Cardinality::AtMostOne)
            .await
    }

    pub async fn query_required_json(
        &self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> Result<String> {
        self.json("query", query, args.into(), Cardinality::AtLeastOne)
            .await
    }

    pub async fn query_required_single_json(
        &self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> Result<String> {
        self.json("query", query, args.into(), Cardinality::One)
            .await
    }

    async fn json(
        &self,
        op: &str,
        query: &str,
        args: QueryArgs,
        cardinality: Cardinality,
    ) -> Result<String> {
        let rows = self
            .run(op, query, &args, OutputFormat::Json, cardinality)
            .await?;
        json_text(rows, cardinality, query)
    }

    // ========================================================================
    // Operation guard
    // ========================================================================

    async fn run(
        &self,
        op: &str,
        query: &str,
        args: &QueryArgs,
        output_format: OutputFormat,
        expected_cardinality: Cardinality,
    ) -> Result<Vec<Value>> {
        let mut guard = self
            .shared
            .conn
            .try_lock()
            .map_err(|_| Error::new(ErrorKind::InterfaceError, IN_PROGRESS))?;
        let holder = guard.as_mut().ok_or_else(exited)?;
        self.check_active(op)?;

        let req = QueryRequest::new(query, args, &self.shared.options)
            .output_format(output_format)
            .expected_cardinality(expected_cardinality);
        let conn = holder.existing()?;
        let result = conn.fetch(&req).await;
        if result.is_err() && in_error(conn) {
            *self.shared.state.lock() = TransactionState::Failed;
        }
        result
    }

    fn check_active(&self, op: &str) -> Result<()> {
        match *self.shared.state.lock() {
            TransactionState::Active => Ok(()),
            state => Err(terminal_state_error(op, state)),
        }
    }

    // ========================================================================
    // Lifecycle (driven by the retry loop)
    // ========================================================================

    pub(crate) async fn commit(&self) -> Result<()> {
        let mut guard = self
            .shared
            .conn
            .try_lock()
            .map_err(|_| Error::new(ErrorKind::InterfaceError, IN_PROGRESS_AT_EXIT))?;
        let holder = guard.as_mut().ok_or_else(exited)?;
        self.check_active("commit")?;

        let result = self.control(holder, "commit").await;
        *self.shared.state.lock() = match &result {
            Ok(()) => TransactionState::Committed,
            Err(_) => TransactionState::Failed,
        };
        result
    }

    pub(crate) async fn rollback(&self) -> Result<()> {
        let mut guard = self
            .shared
            .conn
            .try_lock()
            .map_err(|_| Error::new(ErrorKind::InterfaceError, IN_PROGRESS_AT_EXIT))?;
        let holder = guard.as_mut().ok_or_else(exited)?;
        match *self.shared.state.lock() {
            TransactionState::Active | TransactionState::Failed => {}
            state => return Err(terminal_state_error("rollback", state)),
        }

        self.control(holder, "rollback").await?;
        *self.shared.state.lock() = TransactionState::RolledBack;
        Ok(())
    }

    async fn control(&self, holder: &mut ConnectionHolder, statement: &str) -> Result<()> {
        let args = QueryArgs::None;
        let req = control_request(statement, &args, &self.shared.options);
        holder.existing()?.fetch(&req).await?;
        debug!(statement, "transaction finished");
        Ok(())
    }

    /// Give the connection back to the pool. Later use of any clone of
    /// this handle fails.
    pub(crate) async fn finish(&self) {
        let holder = self.shared.conn.lock().await.take();
        if let Some(holder) = holder {
            holder.release().await;
        }
    }
}

fn control_request<'a>(
    statement: &'a str,
    args: &'a QueryArgs,
    options: &'a Options,
) -> QueryRequest<'a> {
    QueryRequest::new(statement, args, options)
        .output_format(OutputFormat::None)
        .expected_cardinality(Cardinality::NoResult)
        .privileged(true)
}

fn in_error(conn: &RawConnection) -> bool {
    conn.is_closed() || conn.transaction_status() == TransactionStatus::InError
}

fn exited() -> Error {
    Error::new(
        ErrorKind::InterfaceError,
        "the transaction block has already exited; \
         the Transaction handle cannot be used outside of it",
    )
}

fn terminal_state_error(op: &str, state: TransactionState) -> Error {
    let reason = match state {
        TransactionState::Committed => "the transaction is already committed",
        TransactionState::RolledBack => "the transaction is already rolled back",
        TransactionState::Failed => "the transaction is in error state",
        TransactionState::Active => "the transaction is active",
    };
    Error::new(
        ErrorKind::InterfaceError,
        format!("cannot {}; {}", op, reason),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockServer, Reply};
    use crate::pool::{Pool, PoolConfig};

    fn script(query: &str) -> Reply {
        match query {
            "select 1" => Reply::Ints(vec![1]),
            "select broken" => Reply::Error(0x0401_0100, "Unexpected 'broken'".to_string()),
            _ => Reply::Done,
        }
    }

    async fn started(server: &MockServer) -> (Pool, Transaction) {
        let pool = Pool::new(PoolConfig::new(server.connect_config()).concurrency(1));
        let holder = pool.acquire().await.unwrap();
        let tx = Transaction::start(holder, Options::default()).await.unwrap();
        (pool, tx)
    }

    #[test]
    fn test_terminal_state_messages() {
        let err = terminal_state_error("execute", TransactionState::Committed);
        assert_eq!(err.kind(), ErrorKind::InterfaceError);
        assert_eq!(
            err.message(),
            "cannot execute; the transaction is already committed"
        );
        let err = terminal_state_error("rollback", TransactionState::RolledBack);
        assert_eq!(
            err.message(),
            "cannot rollback; the transaction is already rolled back"
        );
    }

    #[tokio::test]
    async fn test_start_sends_start_statement() {
        let server = MockServer::start(script).await;
        let (_pool, tx) = started(&server).await;
        assert_eq!(tx.state(), TransactionState::Active);
        assert_eq!(
            server.executed(),
            vec![Options::default().transaction.start_statement()]
        );
    }

    #[tokio::test]
    async fn test_execute_after_commit_fails() {
        let server = MockServer::start(script).await;
        let (_pool, tx) = started(&server).await;

        assert_eq!(tx.query("select 1", ()).await.unwrap(), vec![Value::Int64(1)]);
        tx.commit().await.unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);

        let err = tx.execute("select 1", ()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InterfaceError);
        assert!(err.message().contains("already committed"), "{}", err);
        let err = tx.rollback().await.unwrap_err();
        assert!(err.message().contains("already committed"), "{}", err);
    }

    #[tokio::test]
    async fn test_second_rollback_fails() {
        let server = MockServer::start(script).await;
        let (_pool, tx) = started(&server).await;

        tx.rollback().await.unwrap();
        let err = tx.rollback().await.unwrap_err();
        assert_eq!(
            err.message(),
            "cannot rollback; the transaction is already rolled back"
        );
        let err = tx.commit().await.unwrap_err();
        assert!(err.message().contains("already rolled back"), "{}", err);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_overlapping_queries_rejected() {
        let server = MockServer::start(script).await;
        let (_pool, tx) = started(&server).await;

        let (first, second) = tokio::join!(tx.query("select 1", ()), tx.query("select 1", ()));
        assert_eq!(first.unwrap(), vec![Value::Int64(1)]);
        let err = second.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InterfaceError);
        assert_eq!(err.message(), IN_PROGRESS);
        assert_eq!(tx.state(), TransactionState::Active);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_lifecycle_during_query_reports_exit_error() {
        let server = MockServer::start(script).await;
        let (_pool, tx) = started(&server).await;

        let (query, commit) = tokio::join!(tx.query("select 1", ()), tx.commit());
        assert_eq!(query.unwrap(), vec![Value::Int64(1)]);
        let err = commit.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InterfaceError);
        assert_eq!(err.message(), IN_PROGRESS_AT_EXIT);
        assert_ne!(err.message(), IN_PROGRESS);
        assert_eq!(tx.state(), TransactionState::Active);

        let (query, rollback) = tokio::join!(tx.query("select 1", ()), tx.rollback());
        assert!(query.is_ok());
        assert_eq!(rollback.unwrap_err().message(), IN_PROGRESS_AT_EXIT);

        tx.rollback().await.unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }

    #[tokio::test]
    async fn test_server_error_fails_transaction() {
        let server = MockServer::start(script).await;
        let (_pool, tx) = started(&server).await;

        let err = tx.query("select broken", ()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EdgeQLSyntaxError);
        assert_eq!(tx.state(), TransactionState::Failed);

        let err = tx.query("select 1", ()).await.unwrap_err();
        assert!(err.message().contains("in error state"), "{}", err);
        // rollback is still possible
        tx.rollback().await.unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }

    #[tokio::test]
    async fn test_local_argument_error_keeps_transaction_active() {
        let server = MockServer::start(script).await;
        let (_pool, tx) = started(&server).await;

        let err = tx
            .query("select 1", vec![Value::Int64(5)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryArgumentError);
        assert_eq!(tx.state(), TransactionState::Active);
    }

    #[tokio::test]
    async fn test_leaked_handle_after_finish() {
        let server = MockServer::start(script).await;
        let (pool, tx) = started(&server).await;

        let leaked = tx.clone();
        tx.commit().await.unwrap();
        tx.finish().await;
        assert_eq!(pool.leased(), 0);

        let err = leaked.query("select 1", ()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InterfaceError);
        assert!(err.message().contains("already exited"), "{}", err);
    }
}
