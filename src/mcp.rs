//! MCP server implementation using rmcp.
//!
//! The front end's view of the grader: the four scheduling entry points plus
//! a read-only status tool. Scheduling tools return as soon as the job is
//! queued; progress is observed by polling `submission_status`.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::evaluation::Orchestrator;
use crate::store::{DataStore, ResultId, ResultRecord, ResultSummary, SubmissionId};

/// MCP server that schedules evaluations.
#[derive(Clone)]
pub struct GraderServer {
    orchestrator: Orchestrator,
    store: Arc<dyn DataStore>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for tools that act on a submission.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SubmissionParams {
    #[schemars(description = "Id of the submission")]
    pub submission_id: SubmissionId,
}

/// Parameters for tools that act on a single result.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ResultParams {
    #[schemars(description = "Id of the result")]
    pub result_id: ResultId,
}

/// What `submission_status` reports.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub submission_id: SubmissionId,
    pub summary: ResultSummary,
    pub results: Vec<ResultRecord>,
    pub jobs_running: usize,
    pub jobs_queued: usize,
}

#[tool_router]
impl GraderServer {
    /// Create a new grader server.
    pub fn new(orchestrator: Orchestrator, store: Arc<dyn DataStore>) -> Self {
        Self {
            orchestrator,
            store,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Evaluate a submission against every combination of its upstream submissions")]
    async fn evaluate_submission(
        &self,
        Parameters(params): Parameters<SubmissionParams>,
    ) -> Result<CallToolResult, McpError> {
        self.require_submission(params.submission_id).await?;
        let job_id = self.orchestrator.evaluate_submission(params.submission_id);
        info!(submission_id = params.submission_id, job_id, "Evaluation queued");
        Ok(queued(format!(
            "Queued evaluation of submission {} (job {job_id})",
            params.submission_id
        )))
    }

    #[tool(description = "Discard a submission's results and evaluate it again from scratch")]
    async fn reevaluate_submission(
        &self,
        Parameters(params): Parameters<SubmissionParams>,
    ) -> Result<CallToolResult, McpError> {
        self.require_submission(params.submission_id).await?;
        let job_id = self.orchestrator.reevaluate_submission(params.submission_id);
        info!(submission_id = params.submission_id, job_id, "Re-evaluation queued");
        Ok(queued(format!(
            "Queued re-evaluation of submission {} (job {job_id})",
            params.submission_id
        )))
    }

    #[tool(description = "Run one pending result with its recorded upstream submissions")]
    async fn evaluate_result(
        &self,
        Parameters(params): Parameters<ResultParams>,
    ) -> Result<CallToolResult, McpError> {
        self.require_result(params.result_id).await?;
        let job_id = self.orchestrator.evaluate_result(params.result_id);
        info!(result_id = params.result_id, job_id, "Result evaluation queued");
        Ok(queued(format!(
            "Queued evaluation of result {} (job {job_id})",
            params.result_id
        )))
    }

    #[tool(description = "Discard one result and re-evaluate its submission from scratch")]
    async fn reevaluate_result(
        &self,
        Parameters(params): Parameters<ResultParams>,
    ) -> Result<CallToolResult, McpError> {
        self.require_result(params.result_id).await?;
        let job_id = self.orchestrator.reevaluate_result(params.result_id);
        info!(result_id = params.result_id, job_id, "Result re-evaluation queued");
        Ok(queued(format!(
            "Queued re-evaluation of result {} (job {job_id})",
            params.result_id
        )))
    }

    #[tool(description = "Show a submission's results (return_code null = pending) and queue load")]
    async fn submission_status(
        &self,
        Parameters(params): Parameters<SubmissionParams>,
    ) -> Result<CallToolResult, McpError> {
        let report = self.status_report(params.submission_id).await?;
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| McpError::internal_error(format!("Failed to encode status: {e}"), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }
}

impl GraderServer {
    async fn status_report(&self, submission_id: SubmissionId) -> Result<StatusReport, McpError> {
        self.require_submission(submission_id).await?;
        let summary = self
            .store
            .submission_summary(submission_id)
            .await
            .map_err(store_error)?;
        let results = self
            .store
            .results_for_submission(submission_id)
            .await
            .map_err(store_error)?;
        let queue = self.orchestrator.queue();
        Ok(StatusReport {
            submission_id,
            summary,
            results,
            jobs_running: queue.running(),
            jobs_queued: queue.queued(),
        })
    }

    async fn require_submission(&self, submission_id: SubmissionId) -> Result<(), McpError> {
        match self.store.submission(submission_id).await.map_err(store_error)? {
            Some(_) => Ok(()),
            None => Err(McpError::invalid_params(
                format!("Unknown submission: {submission_id}"),
                None,
            )),
        }
    }

    async fn require_result(&self, result_id: ResultId) -> Result<(), McpError> {
        match self.store.result(result_id).await.map_err(store_error)? {
            Some(_) => Ok(()),
            None => Err(McpError::invalid_params(
                format!("Unknown result: {result_id}"),
                None,
            )),
        }
    }
}

fn queued(message: String) -> CallToolResult {
    CallToolResult::success(vec![Content::text(message)])
}

fn store_error(e: crate::error::Error) -> McpError {
    error!(error = %e, "Data store query failed");
    McpError::internal_error(format!("Data store error: {e}"), None)
}

#[tool_handler]
impl ServerHandler for GraderServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "demograder".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Schedule sandboxed evaluation of course submissions.\n\
                 Up to {} evaluations run at once; the rest wait in the queue.\n\
                 \n\
                 Call 'evaluate_submission' after an upload commits. All scheduling\n\
                 tools return immediately; poll 'submission_status' to see results\n\
                 move from pending (return_code null) to final.",
                self.orchestrator.queue().max_concurrency()
            )),
        }
    }
}

/// Serve the grader over stdio until the client disconnects.
pub async fn serve_stdio(orchestrator: Orchestrator, store: Arc<dyn DataStore>) -> anyhow::Result<()> {
    let server = GraderServer::new(orchestrator, store);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
