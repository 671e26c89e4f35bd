//! Per-client options: transaction flags, retry policy and session state.
//!
//! All option types are immutable values; the `with_*` methods return a
//! modified copy so a client can derive variants without affecting others.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::codec::Value;
use crate::error::{Error, ErrorKind};
use crate::wire::protocol::Annotations;

// ============================================================================
// Transaction options
// ============================================================================

/// Isolation level of a transaction block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Serializable,
    RepeatableRead,
}

impl IsolationLevel {
    fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
        }
    }
}

/// Flags for `START TRANSACTION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    pub readonly: bool,
    pub deferrable: bool,
}

impl TransactionOptions {
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = deferrable;
        self
    }

    /// The statement that opens a transaction block with these flags.
    pub fn start_statement(&self) -> String {
        format!(
            "START TRANSACTION ISOLATION {}, {}, {}DEFERRABLE;",
            self.isolation.as_sql(),
            if self.readonly { "READ ONLY" } else { "READ WRITE" },
            if self.deferrable { "" } else { "NOT " },
        )
    }
}

// ============================================================================
// Retry options
// ============================================================================

/// Error classes that can carry their own retry rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryCondition {
    /// Serialization failures, deadlocks and other transaction conflicts.
    TransactionConflict,
    /// Client-side connection failures.
    NetworkError,
}

/// Back-off delay for the given attempt number (starting at 1).
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// `2^attempt * 100ms` plus up to 100ms of jitter.
pub fn default_backoff(attempt: u32) -> Duration {
    let base = 100u64.saturating_mul(1u64 << attempt.min(16));
    let jitter = rand::thread_rng().gen_range(0..100);
    Duration::from_millis(base + jitter)
}

/// How many attempts to make and how long to wait between them.
#[derive(Clone)]
pub struct RetryRule {
    pub attempts: u32,
    backoff: BackoffFn,
}

impl RetryRule {
    pub fn new(attempts: u32, backoff: BackoffFn) -> Self {
        Self { attempts, backoff }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        (self.backoff)(attempt)
    }
}

impl Default for RetryRule {
    fn default() -> Self {
        Self::new(3, Arc::new(default_backoff))
    }
}

impl fmt::Debug for RetryRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRule")
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

/// Default rule plus per-condition overrides.
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    default: RetryRule,
    overrides: HashMap<RetryCondition, RetryRule>,
}

impl RetryOptions {
    pub fn new(attempts: u32, backoff: BackoffFn) -> Self {
        Self {
            default: RetryRule::new(attempts, backoff),
            overrides: HashMap::new(),
        }
    }

    /// Never retry.
    pub fn no_retry() -> Self {
        Self::new(1, Arc::new(default_backoff))
    }

    /// Override the rule for one condition. `backoff` defaults to
    /// [`default_backoff`].
    pub fn with_rule(
        mut self,
        condition: RetryCondition,
        attempts: u32,
        backoff: Option<BackoffFn>,
    ) -> Self {
        let backoff = backoff.unwrap_or_else(|| Arc::new(default_backoff));
        self.overrides
            .insert(condition, RetryRule::new(attempts, backoff));
        self
    }

    pub fn default_rule(&self) -> &RetryRule {
        &self.default
    }

    /// The rule that governs retrying after `err`.
    pub fn rule_for(&self, err: &Error) -> &RetryRule {
        let condition = if err.is(ErrorKind::TransactionConflictError) {
            Some(RetryCondition::TransactionConflict)
        } else if err.is(ErrorKind::ClientError) {
            Some(RetryCondition::NetworkError)
        } else {
            None
        };
        condition
            .and_then(|c| self.overrides.get(&c))
            .unwrap_or(&self.default)
    }
}

// ============================================================================
// Session state
// ============================================================================

/// Module, aliases, config and globals sent along with every query.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub module: String,
    pub module_aliases: Vec<(String, String)>,
    pub config: Vec<(String, Value)>,
    pub globals: Vec<(String, Value)>,
}

pub const DEFAULT_MODULE: &str = "default";

impl Default for Session {
    fn default() -> Self {
        Self {
            module: DEFAULT_MODULE.to_string(),
            module_aliases: Vec::new(),
            config: Vec::new(),
            globals: Vec::new(),
        }
    }
}

/// Insert or replace entries of `target` by key.
fn merge<V: Clone>(target: &mut Vec<(String, V)>, entries: impl IntoIterator<Item = (String, V)>) {
    for (key, value) in entries {
        match target.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => target.push((key, value)),
        }
    }
}

impl Session {
    /// Whether this session matches the server default, in which case no
    /// state is sent.
    pub fn is_default(&self) -> bool {
        self.module == DEFAULT_MODULE
            && self.module_aliases.is_empty()
            && self.config.is_empty()
            && self.globals.is_empty()
    }

    pub fn with_module_aliases<K, V, I>(&self, aliases: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut session = self.clone();
        let aliases = aliases.into_iter().map(|(k, v)| (k.into(), v.into()));
        let mut rest = Vec::new();
        for (alias, module) in aliases {
            // the empty alias names the current module
            if alias.is_empty() {
                session.module = module;
            } else {
                rest.push((alias, module));
            }
        }
        merge(&mut session.module_aliases, rest);
        session
    }

    pub fn with_config<K, V, I>(&self, config: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut session = self.clone();
        merge(
            &mut session.config,
            config.into_iter().map(|(k, v)| (k.into(), v.into())),
        );
        session
    }

    /// Set globals; unqualified names resolve against the current module.
    pub fn with_globals<K, V, I>(&self, globals: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut session = self.clone();
        let globals: Vec<(String, Value)> = globals
            .into_iter()
            .map(|(k, v)| (self.qualify(k.into()), v.into()))
            .collect();
        merge(&mut session.globals, globals);
        session
    }

    pub fn without_globals(&self) -> Self {
        Self {
            globals: Vec::new(),
            ..self.clone()
        }
    }

    pub fn without_config(&self) -> Self {
        Self {
            config: Vec::new(),
            ..self.clone()
        }
    }

    fn qualify(&self, name: String) -> String {
        if name.contains("::") {
            name
        } else {
            format!("{}::{}", self.module, name)
        }
    }

    /// The value encoded through the server's state codec.
    pub(crate) fn to_state_value(&self) -> Value {
        let mut fields = Vec::new();
        if self.module != DEFAULT_MODULE {
            fields.push(("module".to_string(), Value::Str(self.module.clone())));
        }
        if !self.module_aliases.is_empty() {
            let aliases = self
                .module_aliases
                .iter()
                .map(|(alias, module)| {
                    Value::Tuple(vec![Value::Str(alias.clone()), Value::Str(module.clone())])
                })
                .collect();
            fields.push(("aliases".to_string(), Value::Array(aliases)));
        }
        if !self.config.is_empty() {
            fields.push(("config".to_string(), Value::Object(self.config.clone())));
        }
        if !self.globals.is_empty() {
            fields.push(("globals".to_string(), Value::Object(self.globals.clone())));
        }
        Value::Object(fields)
    }
}

// ============================================================================
// Options
// ============================================================================

/// Everything a query needs besides its text and arguments.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub retry: RetryOptions,
    pub transaction: TransactionOptions,
    pub session: Arc<Session>,
    pub annotations: Annotations,
}

impl Options {
    pub fn with_retry_options(&self, retry: RetryOptions) -> Self {
        Self {
            retry,
            ..self.clone()
        }
    }

    pub fn with_transaction_options(&self, transaction: TransactionOptions) -> Self {
        Self {
            transaction,
            ..self.clone()
        }
    }

    pub fn with_session(&self, session: Session) -> Self {
        Self {
            session: Arc::new(session),
            ..self.clone()
        }
    }

    /// Attach a query annotation (sent with protocol 3.0 and later).
    pub fn with_annotation(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut options = self.clone();
        merge(&mut options.annotations, [(name.into(), value.into())]);
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_statement() {
        assert_eq!(
            TransactionOptions::default().start_statement(),
            "START TRANSACTION ISOLATION SERIALIZABLE, READ WRITE, NOT DEFERRABLE;"
        );
        let opts = TransactionOptions::default()
            .isolation(IsolationLevel::RepeatableRead)
            .readonly(true)
            .deferrable(true);
        assert_eq!(
            opts.start_statement(),
            "START TRANSACTION ISOLATION REPEATABLE READ, READ ONLY, DEFERRABLE;"
        );
    }

    #[test]
    fn test_default_backoff_range() {
        for attempt in 1..4 {
            let d = default_backoff(attempt).as_millis() as u64;
            let base = 100 * (1 << attempt);
            assert!(d >= base && d < base + 100, "attempt {}: {}ms", attempt, d);
        }
    }

    #[test]
    fn test_rule_for_error_kind() {
        let retry = RetryOptions::default()
            .with_rule(RetryCondition::TransactionConflict, 10, None)
            .with_rule(RetryCondition::NetworkError, 2, None);

        let conflict = Error::new(ErrorKind::TransactionSerializationError, "x");
        assert_eq!(retry.rule_for(&conflict).attempts, 10);

        let network = Error::new(ErrorKind::ClientConnectionFailedTemporarilyError, "x");
        assert_eq!(retry.rule_for(&network).attempts, 2);

        let other = Error::new(ErrorKind::QueryError, "x");
        assert_eq!(retry.rule_for(&other).attempts, 3);
    }

    #[test]
    fn test_custom_backoff() {
        let retry = RetryOptions::new(5, Arc::new(|n| Duration::from_millis(n as u64)));
        assert_eq!(retry.default_rule().backoff(7), Duration::from_millis(7));
    }

    #[test]
    fn test_session_default_and_globals() {
        let session = Session::default();
        assert!(session.is_default());
        assert_eq!(session.to_state_value(), Value::Object(vec![]));

        let session = session
            .with_globals([("user_id", Value::Int64(7))])
            .with_globals([("other::flag", true)]);
        assert!(!session.is_default());
        assert_eq!(
            session.globals,
            vec![
                ("default::user_id".to_string(), Value::Int64(7)),
                ("other::flag".to_string(), Value::Bool(true)),
            ]
        );
    }

    #[test]
    fn test_session_state_value() {
        let session = Session::default()
            .with_module_aliases([("", "app"), ("m", "mod")])
            .with_config([("allow_user_specified_id", true)]);
        assert_eq!(
            session.to_state_value(),
            Value::Object(vec![
                ("module".to_string(), Value::Str("app".into())),
                (
                    "aliases".to_string(),
                    Value::Array(vec![Value::Tuple(vec![
                        Value::Str("m".into()),
                        Value::Str("mod".into())
                    ])])
                ),
                (
                    "config".to_string(),
                    Value::Object(vec![(
                        "allow_user_specified_id".to_string(),
                        Value::Bool(true)
                    )])
                ),
            ])
        );
    }

    #[test]
    fn test_options_copy_on_write() {
        let base = Options::default();
        let tagged = base.with_annotation("tag", "a").with_annotation("tag", "b");
        assert!(base.annotations.is_empty());
        assert_eq!(tagged.annotations, vec![("tag".to_string(), "b".to_string())]);
    }
}
