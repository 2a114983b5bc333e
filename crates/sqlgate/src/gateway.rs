//! Two-phase execution gateway.
//!
//! `propose` classifies a submission and either rejects it, runs it straight
//! away (pure `SELECT`s) or parks it behind a confirmation token.
//! `confirm_and_execute` redeems such a token and runs the parked text.

use std::{any::Any, collections::BTreeSet, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::{
    classifier::{self, Classification, QueryType},
    executor::{ExecutionResult, SqlExecutor},
    sql,
    tokens::{token_fingerprint, ConfirmationTokenStore},
};

/// Message returned for unknown, expired and already used tokens alike.
pub const INVALID_TOKEN_MESSAGE: &str = "Invalid or expired confirmation token";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Operation '{keyword}' is not allowed. Only SELECT, INSERT, UPDATE and DELETE statements are permitted.")]
    Forbidden { keyword: String },
    #[error("{}", INVALID_TOKEN_MESSAGE)]
    Unauthorized,
    #[error("query execution failed: {message}")]
    Execution { query: String, message: String },
}

/// What the caller learns about a parked mutation before confirming it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimatedImpact {
    pub query_type: QueryType,
    pub tables: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
    /// The submission exactly as received.
    pub query: String,
    pub token: String,
    pub expires_in: Duration,
    pub estimated_impact: EstimatedImpact,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProposeOutcome {
    Executed(ExecutionResult),
    NeedsConfirmation(PendingMutation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedExecution {
    pub query: String,
    pub result: ExecutionResult,
    pub executed_at: DateTime<Utc>,
}

pub struct ExecutionGateway<E: ?Sized> {
    executor: Arc<E>,
    tokens: Arc<ConfirmationTokenStore>,
}

impl<E: ?Sized> Clone for ExecutionGateway<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            tokens: self.tokens.clone(),
        }
    }
}

impl<E> ExecutionGateway<E>
where
    E: SqlExecutor + ?Sized,
{
    pub fn new(executor: Arc<E>, tokens: Arc<ConfirmationTokenStore>) -> Self {
        Self { executor, tokens }
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    pub fn tokens(&self) -> &Arc<ConfirmationTokenStore> {
        &self.tokens
    }

    #[instrument(skip_all, fields(sql_len = sql_text.len()))]
    pub async fn propose(&self, sql_text: &str) -> Result<ProposeOutcome, GatewayError> {
        if sql_text.trim().is_empty() {
            return Err(GatewayError::InvalidInput("sql must not be empty".into()));
        }

        let statements = sql::split_statements(sql_text);
        if statements.is_empty() {
            return Err(GatewayError::InvalidInput(
                "no SQL statements found after removing comments".into(),
            ));
        }

        match classifier::classify(&statements) {
            Classification::Forbidden(keyword) => {
                warn!(%keyword, statements = statements.len(), "rejected forbidden SQL operation");
                Err(GatewayError::Forbidden { keyword })
            }
            Classification::Mutating { query_type, tables } => {
                let issued = self.tokens.issue(sql_text);
                info!(
                    %query_type,
                    tables = ?tables,
                    token_fingerprint = %token_fingerprint(&issued.token),
                    "mutating SQL parked pending confirmation"
                );
                Ok(ProposeOutcome::NeedsConfirmation(PendingMutation {
                    query: sql_text.to_owned(),
                    token: issued.token,
                    expires_in: issued.expires_in,
                    estimated_impact: EstimatedImpact { query_type, tables },
                }))
            }
            Classification::ReadOnly => {
                let result = self.run(sql_text).await?;
                info!(rows = result.rows.len(), "read-only SQL executed");
                Ok(ProposeOutcome::Executed(result))
            }
        }
    }

    #[instrument(skip_all, fields(token_fingerprint = %token_fingerprint(token)))]
    pub async fn confirm_and_execute(
        &self,
        token: &str,
    ) -> Result<ConfirmedExecution, GatewayError> {
        if token.is_empty() {
            return Err(GatewayError::InvalidInput("token must not be empty".into()));
        }

        let Some(query) = self.tokens.get_and_invalidate(token) else {
            warn!("confirmation token rejected");
            return Err(GatewayError::Unauthorized);
        };

        let result = self.run(&query).await?;
        info!(
            rows_affected = result.rows_affected,
            "confirmed SQL executed"
        );
        Ok(ConfirmedExecution {
            query,
            result,
            executed_at: Utc::now(),
        })
    }

    async fn run(&self, query: &str) -> Result<ExecutionResult, GatewayError> {
        let outcome = AssertUnwindSafe(self.executor.execute(query))
            .catch_unwind()
            .await;

        let message = match outcome {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(err)) => format!("{err:#}"),
            Err(payload) => panic_message(payload),
        };

        warn!(error = %message, "SQL execution failed");
        Err(GatewayError::Execution {
            query: query.to_owned(),
            message,
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{executor::InsertId, tokens::TokenStoreConfig};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
        behaviour: Behaviour,
    }

    impl RecordingExecutor {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                behaviour,
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl SqlExecutor for RecordingExecutor {
        async fn execute(&self, sql: &str) -> Result<ExecutionResult> {
            self.calls.lock().push(sql.to_owned());
            match self.behaviour {
                Behaviour::Succeed => Ok(ExecutionResult {
                    columns: vec!["id".into()],
                    rows: vec![vec![json!(1)]],
                    rows_affected: 1,
                    last_insert_rowid: InsertId::from(1),
                }),
                Behaviour::Fail => Err(anyhow!("no such table: users")),
                Behaviour::Panic => panic!("driver exploded"),
            }
        }

        async fn schema(&self) -> Result<String> {
            Ok(String::new())
        }
    }

    fn gateway(executor: Arc<RecordingExecutor>) -> ExecutionGateway<RecordingExecutor> {
        ExecutionGateway::new(
            executor,
            Arc::new(ConfirmationTokenStore::new(TokenStoreConfig::default())),
        )
    }

    fn pending(outcome: ProposeOutcome) -> PendingMutation {
        match outcome {
            ProposeOutcome::NeedsConfirmation(pending) => pending,
            other => panic!("expected confirmation request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forbidden_sql_never_reaches_the_database() {
        let executor = RecordingExecutor::new(Behaviour::Succeed);
        let gateway = gateway(executor.clone());

        for sql in [
            "CREATE TABLE t (id INT)",
            "DROP TABLE users",
            "ALTER TABLE users ADD COLUMN x INT",
            "TRUNCATE users",
            "SELECT 1; DROP TABLE x;",
            "/* comment */ CREATE TABLE t (id INT)",
        ] {
            let err = gateway.propose(sql).await.unwrap_err();
            assert!(matches!(err, GatewayError::Forbidden { .. }), "{sql}");
        }

        assert!(executor.calls().is_empty());
        assert_eq!(gateway.tokens().active_token_count(), 0);
    }

    #[tokio::test]
    async fn forbidden_error_names_the_keyword() {
        let gateway = gateway(RecordingExecutor::new(Behaviour::Succeed));
        let err = gateway.propose("SELECT 1; drop table x").await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::Forbidden {
                keyword: "DROP".into()
            }
        );
        assert!(err.to_string().contains("'DROP'"));
    }

    #[tokio::test]
    async fn select_runs_immediately_with_original_text() {
        let executor = RecordingExecutor::new(Behaviour::Succeed);
        let gateway = gateway(executor.clone());
        let sql = "select id\n  from users -- all of them";

        let outcome = gateway.propose(sql).await.unwrap();

        assert!(matches!(outcome, ProposeOutcome::Executed(ref r) if r.rows.len() == 1));
        assert_eq!(executor.calls(), vec![sql.to_string()]);
        assert_eq!(gateway.tokens().active_token_count(), 0);
    }

    #[tokio::test]
    async fn mutation_is_parked_behind_a_token() {
        let executor = RecordingExecutor::new(Behaviour::Succeed);
        let gateway = gateway(executor.clone());
        let sql = "INSERT INTO users (name) VALUES ('x')";

        let pending = pending(gateway.propose(sql).await.unwrap());

        assert_eq!(pending.token.len(), 64);
        assert!(pending.token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(pending.query, sql);
        assert_eq!(pending.expires_in, Duration::from_secs(300));
        assert_eq!(pending.estimated_impact.query_type, QueryType::Insert);
        assert_eq!(
            pending.estimated_impact.tables,
            BTreeSet::from(["users".to_string()])
        );
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn confirmation_runs_the_exact_original_text_once() {
        let executor = RecordingExecutor::new(Behaviour::Succeed);
        let gateway = gateway(executor.clone());
        let sql = "INSERT INTO users (name) VALUES ('x')";
        let token = pending(gateway.propose(sql).await.unwrap()).token;

        let confirmed = gateway.confirm_and_execute(&token).await.unwrap();
        assert_eq!(confirmed.query, sql);
        assert_eq!(confirmed.result.rows_affected, 1);
        assert_eq!(executor.calls(), vec![sql.to_string()]);

        let err = gateway.confirm_and_execute(&token).await.unwrap_err();
        assert_eq!(err, GatewayError::Unauthorized);
        assert_eq!(err.to_string(), INVALID_TOKEN_MESSAGE);
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn multi_statement_mutation_keeps_casing_and_statements() {
        let executor = RecordingExecutor::new(Behaviour::Succeed);
        let gateway = gateway(executor.clone());
        let sql = "Update Users set active = 0 where id = 1;\ndelete from Sessions where user_id = 1;";

        let pending = pending(gateway.propose(sql).await.unwrap());
        assert_eq!(pending.estimated_impact.query_type, QueryType::Update);
        assert_eq!(
            pending.estimated_impact.tables,
            BTreeSet::from(["sessions".to_string(), "users".to_string()])
        );

        gateway.confirm_and_execute(&pending.token).await.unwrap();
        assert_eq!(executor.calls(), vec![sql.to_string()]);
    }

    #[tokio::test]
    async fn unknown_and_empty_tokens_are_rejected() {
        let executor = RecordingExecutor::new(Behaviour::Succeed);
        let gateway = gateway(executor.clone());

        assert_eq!(
            gateway.confirm_and_execute(&"0".repeat(64)).await.unwrap_err(),
            GatewayError::Unauthorized
        );
        assert!(matches!(
            gateway.confirm_and_execute("").await.unwrap_err(),
            GatewayError::InvalidInput(_)
        ));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_confirmation_consumes_the_token() {
        let executor = RecordingExecutor::new(Behaviour::Fail);
        let gateway = gateway(executor.clone());
        let sql = "DELETE FROM users WHERE id = 9";
        let token = pending(gateway.propose(sql).await.unwrap()).token;

        let err = gateway.confirm_and_execute(&token).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::Execution {
                query: sql.into(),
                message: "no such table: users".into(),
            }
        );

        assert_eq!(
            gateway.confirm_and_execute(&token).await.unwrap_err(),
            GatewayError::Unauthorized
        );
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn read_failure_is_reported_as_execution_error() {
        let gateway = gateway(RecordingExecutor::new(Behaviour::Fail));
        let err = gateway.propose("SELECT * FROM users").await.unwrap_err();
        assert!(matches!(err, GatewayError::Execution { ref query, .. } if query == "SELECT * FROM users"));
    }

    #[tokio::test]
    async fn panicking_executor_becomes_execution_error() {
        let gateway = gateway(RecordingExecutor::new(Behaviour::Panic));
        let err = gateway.propose("SELECT 1").await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::Execution {
                query: "SELECT 1".into(),
                message: "driver exploded".into(),
            }
        );
    }

    #[tokio::test]
    async fn empty_submissions_are_invalid_input() {
        let executor = RecordingExecutor::new(Behaviour::Succeed);
        let gateway = gateway(executor.clone());

        for sql in ["", "   ", "-- just a note", "/* nothing */ ;"] {
            assert!(
                matches!(gateway.propose(sql).await, Err(GatewayError::InvalidInput(_))),
                "{sql:?}"
            );
        }
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn panic_payloads_are_rendered_as_text() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(17_u8)), "unknown panic");
    }
}
