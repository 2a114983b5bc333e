//! Request and response bodies of the HTTP surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlgate::{ConfirmedExecution, ExecutionResult, InsertId, PendingMutation, QueryType};
use utoipa::ToSchema;

pub const EXECUTE_ENDPOINT: &str = "/api/v1/query/execute";

const CONFIRMATION_WARNING: &str = "This query modifies data and was not executed. Review it, then \
     send the confirmation token to the execute endpoint before it expires.";

#[derive(Debug, Deserialize, ToSchema)]
pub struct ProposeBody {
    /// SQL text; may contain several `;` separated statements.
    pub sql: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConfirmBody {
    #[schema(min_length = 1)]
    pub token: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryResultResponse {
    pub columns: Vec<String>,
    #[schema(value_type = Vec<Object>)]
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
    /// Number when it fits a double exactly, decimal string otherwise.
    #[schema(value_type = Object)]
    pub last_insert_rowid: InsertId,
}

impl From<ExecutionResult> for QueryResultResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            columns: result.columns,
            rows: result.rows,
            rows_affected: result.rows_affected,
            last_insert_rowid: result.last_insert_rowid,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EstimatedImpactDto {
    pub query_type: QueryType,
    pub tables: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequiredResponse {
    pub warning: String,
    pub query: String,
    pub confirmation_token: String,
    pub execute_endpoint: String,
    pub expires_in: String,
    pub estimated_impact: EstimatedImpactDto,
}

impl From<PendingMutation> for ConfirmationRequiredResponse {
    fn from(pending: PendingMutation) -> Self {
        Self {
            warning: CONFIRMATION_WARNING.to_string(),
            query: pending.query,
            confirmation_token: pending.token,
            execute_endpoint: EXECUTE_ENDPOINT.to_string(),
            expires_in: format!("{} seconds", pending.expires_in.as_secs()),
            estimated_impact: EstimatedImpactDto {
                query_type: pending.estimated_impact.query_type,
                tables: pending.estimated_impact.tables.into_iter().collect(),
            },
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedExecutionResponse {
    pub success: bool,
    pub query: String,
    pub result: QueryResultResponse,
    pub executed_at: String,
}

impl From<ConfirmedExecution> for ConfirmedExecutionResponse {
    fn from(confirmed: ConfirmedExecution) -> Self {
        Self {
            success: true,
            query: confirmed.query,
            result: confirmed.result.into(),
            executed_at: confirmed.executed_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SchemaResponse {
    pub schema: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    /// Recovered SQL text when a confirmed execution failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Leading word of the refused statement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}
