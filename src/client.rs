//! The public client.
//!
//! `Client` is a cheap, cloneable handle over a shared pool plus a set of
//! options. The `with_*` methods derive a new client that shares the pool
//! but runs queries with different options.

use std::future::Future;

use crate::codec::registry::init_builtins;
use crate::codec::{QueryArgs, Value};
use crate::error::{Error, ErrorKind, Result};
use crate::options::{Options, RetryOptions, Session, TransactionOptions};
use crate::pool::{Pool, PoolConfig};
use crate::transaction::Transaction;
use crate::wire::{Cardinality, ConnectConfig, OutputFormat, QueryRequest};

/// A Gel client.
///
/// ```no_run
/// # async fn demo() -> gelwire::Result<()> {
/// let client = gelwire::Client::from_dsn("gel://admin@localhost:5656/main")?;
/// let names = client.query("select User.name", ()).await?;
/// client
///     .transaction(|tx| async move {
///         tx.execute("insert User { name := <str>$0 }", vec![gelwire::Value::from("alice")])
///             .await
///     })
///     .await?;
/// # let _ = names;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    pool: Pool,
    options: Options,
}

impl Client {
    /// Create a client. Connections are opened on first use.
    pub fn new(config: PoolConfig) -> Self {
        init_builtins();
        Self {
            pool: Pool::new(config),
            options: Options::default(),
        }
    }

    /// Create a client from a `gel://` DSN.
    pub fn from_dsn(dsn: &str) -> Result<Self> {
        Ok(Self::new(PoolConfig::new(ConnectConfig::from_dsn(dsn)?)))
    }

    /// Open a connection now instead of on the first query.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.pool.ensure_connected().await
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run a statement, discarding any result.
    pub async fn execute(&self, query: &str, args: impl Into<QueryArgs>) -> Result<()> {
        self.fetch(query, &args.into(), OutputFormat::None, Cardinality::NoResult)
            .await
            .map(|_| ())
    }

    pub async fn query(&self, query: &str, args: impl Into<QueryArgs>) -> Result<Vec<Value>> {
        self.fetch(query, &args.into(), OutputFormat::Binary, Cardinality::Many)
            .await
    }

    /// At most one result; `None` when the query returns nothing.
    pub async fn query_single(
        &self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> Result<Option<Value>> {
        let rows = self
            .fetch(query, &args.into(), OutputFormat::Binary, Cardinality::AtMostOne)
            .await?;
        Ok(rows.into_iter().next())
    }

    /// One or more results; an empty result is a `NoDataError`.
    pub async fn query_required(
        &self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> Result<Vec<Value>> {
        let rows = self
            .fetch(query, &args.into(), OutputFormat::Binary, Cardinality::AtLeastOne)
            .await?;
        required(rows, query)
    }

    /// Exactly one result; an empty result is a `NoDataError`.
    pub async fn query_required_single(
        &self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> Result<Value> {
        let rows = self
            .fetch(query, &args.into(), OutputFormat::Binary, Cardinality::One)
            .await?;
        required_single(rows, query)
    }

    /// The results as a JSON array.
    pub async fn query_json(&self, query: &str, args: impl Into<QueryArgs>) -> Result<String> {
        self.fetch_json(query, args.into(), Cardinality::Many).await
    }

    pub async fn query_single_json(
        &self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> Result<String> {
        self.fetch_json(query, args.into(), Cardinality::AtMostOne)
            .await
    }

    pub async fn query_required_json(
        &self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> Result<String> {
        self.fetch_json(query, args.into(), Cardinality::AtLeastOne)
            .await
    }

    pub async fn query_required_single_json(
        &self,
        query: &str,
        args: impl Into<QueryArgs>,
    ) -> Result<String> {
        self.fetch_json(query, args.into(), Cardinality::One).await
    }

    async fn fetch_json(
        &self,
        query: &str,
        args: QueryArgs,
        cardinality: Cardinality,
    ) -> Result<String> {
        let rows = self
            .fetch(query, &args, OutputFormat::Json, cardinality)
            .await?;
        json_text(rows, cardinality, query)
    }

    async fn fetch(
        &self,
        query: &str,
        args: &QueryArgs,
        output_format: OutputFormat,
        expected_cardinality: Cardinality,
    ) -> Result<Vec<Value>> {
        let req = QueryRequest::new(query, args, &self.options)
            .output_format(output_format)
            .expected_cardinality(expected_cardinality);
        let mut holder = self.pool.acquire().await?;
        let result = holder.retrying_fetch(&req).await;
        holder.release().await;
        result
    }

    /// Run `body` in a transaction, retrying on conflicts.
    ///
    /// `body` may run more than once and should have no side effects
    /// outside the database.
    pub async fn transaction<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.pool.transaction(&self.options, body).await
    }

    // ========================================================================
    // Derived clients
    // ========================================================================

    pub fn with_retry_options(&self, retry: RetryOptions) -> Self {
        self.with_options(self.options.with_retry_options(retry))
    }

    pub fn with_transaction_options(&self, transaction: TransactionOptions) -> Self {
        self.with_options(self.options.with_transaction_options(transaction))
    }

    pub fn with_session(&self, session: Session) -> Self {
        self.with_options(self.options.with_session(session))
    }

    pub fn with_globals<K, V, I>(&self, globals: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.with_session(self.options.session.with_globals(globals))
    }

    pub fn with_config<K, V, I>(&self, config: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.with_session(self.options.session.with_config(config))
    }

    pub fn with_module_aliases<K, V, I>(&self, aliases: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.with_session(self.options.session.with_module_aliases(aliases))
    }

    pub fn with_annotation(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_options(self.options.with_annotation(name, value))
    }

    fn with_options(&self, options: Options) -> Self {
        Self {
            pool: self.pool.clone(),
            options,
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Wait for running queries, then close every connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Close every idle connection right away.
    pub fn terminate(&self) {
        self.pool.terminate();
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

// ============================================================================
// Result shaping (shared with Transaction)
// ============================================================================

fn no_data(method: &str, query: &str) -> Error {
    Error::new(
        ErrorKind::NoDataError,
        format!("query executed via {}() returned no data", method),
    )
    .with_query(query)
}

pub(crate) fn required(rows: Vec<Value>, query: &str) -> Result<Vec<Value>> {
    if rows.is_empty() {
        return Err(no_data("query_required", query));
    }
    Ok(rows)
}

pub(crate) fn required_single(rows: Vec<Value>, query: &str) -> Result<Value> {
    rows.into_iter()
        .next()
        .ok_or_else(|| no_data("query_required_single", query))
}

/// The JSON text of a JSON-format result.
pub(crate) fn json_text(rows: Vec<Value>, cardinality: Cardinality, query: &str) -> Result<String> {
    let text = match rows.into_iter().next() {
        Some(Value::Str(text)) | Some(Value::Json(text)) => Some(text),
        Some(_) => {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                "expected JSON text in a JSON-format result",
            )
            .with_query(query))
        }
        None => None,
    };
    match (cardinality, text) {
        (Cardinality::AtLeastOne, Some(text)) if text.trim() == "[]" => {
            Err(no_data("query_required_json", query))
        }
        (_, Some(text)) => Ok(text),
        (Cardinality::One, None) => Err(no_data("query_required_single_json", query)),
        (Cardinality::AtLeastOne, None) => Err(no_data("query_required_json", query)),
        (Cardinality::Many, None) => Ok("[]".to_string()),
        (_, None) => Ok("null".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockServer, Reply};

    fn script(query: &str) -> Reply {
        match query {
            "select {1, 2}" => Reply::Ints(vec![1, 2]),
            "select <int64>{}" => Reply::Ints(vec![]),
            "select <json>{1, 2}" => Reply::Strs(vec!["[1, 2]".to_string()]),
            "select <json>{}" => Reply::Strs(vec!["[]".to_string()]),
            "select <json><int64>{}" => Reply::Strs(vec![]),
            _ => Reply::Done,
        }
    }

    async fn client(server: &MockServer) -> Client {
        Client::new(PoolConfig::new(server.connect_config()).concurrency(2))
    }

    #[test]
    fn test_json_text_defaults() {
        assert_eq!(json_text(vec![], Cardinality::Many, "q").unwrap(), "[]");
        assert_eq!(json_text(vec![], Cardinality::AtMostOne, "q").unwrap(), "null");
        let err = json_text(vec![], Cardinality::One, "q").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoDataError);
        assert_eq!(err.query(), Some("q"));
        assert!(json_text(vec![Value::Int64(1)], Cardinality::Many, "q").is_err());
    }

    #[tokio::test]
    async fn test_query_shapes() {
        let server = MockServer::start(script).await;
        let client = client(&server).await;

        assert_eq!(
            client.query("select {1, 2}", ()).await.unwrap(),
            vec![Value::Int64(1), Value::Int64(2)]
        );
        assert_eq!(client.query_single("select <int64>{}", ()).await.unwrap(), None);
        assert!(client.query("select <int64>{}", ()).await.unwrap().is_empty());

        let err = client
            .query_required("select <int64>{}", ())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoDataError);
        assert_eq!(err.query(), Some("select <int64>{}"));

        let err = client
            .query_required_single("select <int64>{}", ())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoDataError);

        client.execute("insert Item", ()).await.unwrap();
    }

    #[tokio::test]
    async fn test_json_queries() {
        let server = MockServer::start(script).await;
        let client = client(&server).await;

        assert_eq!(
            client.query_json("select <json>{1, 2}", ()).await.unwrap(),
            "[1, 2]"
        );
        assert_eq!(
            client
                .query_single_json("select <json><int64>{}", ())
                .await
                .unwrap(),
            "null"
        );
        let err = client
            .query_required_json("select <json>{}", ())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoDataError);
    }

    #[tokio::test]
    async fn test_derived_clients_share_pool() {
        let server = MockServer::start(script).await;
        let client = client(&server).await;
        let scoped = client
            .with_globals([("current_user", "alice")])
            .with_annotation("tag", "report");

        assert!(client.options().session.is_default());
        assert_eq!(
            scoped.options().session.globals,
            vec![("default::current_user".to_string(), Value::from("alice"))]
        );
        assert_eq!(
            scoped.options().annotations,
            vec![("tag".to_string(), "report".to_string())]
        );

        client.ensure_connected().await.unwrap();
        assert_eq!(scoped.pool().idle_count(), 1);
        scoped.close().await;
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_transaction_returns_body_value() {
        let server = MockServer::start(script).await;
        let client = client(&server).await;

        let rows = client
            .transaction(|tx| async move { tx.query("select {1, 2}", ()).await })
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(server.executed().last().map(String::as_str), Some("commit"));
    }

    #[tokio::test]
    async fn test_closed_client_rejects_queries() {
        let server = MockServer::start(script).await;
        let client = client(&server).await;
        client.close().await;

        let err = client.query("select {1, 2}", ()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InterfaceError);
        assert_eq!(err.message(), "The client is closed");
    }
}
