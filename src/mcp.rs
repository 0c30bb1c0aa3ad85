//! MCP server implementation using rmcp.
//!
//! Exposes the execution engine, the function registry and the execution
//! history as MCP tools.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::engine::Engine;
use crate::history::{HistoryEntry, MetricsHistory};
use crate::registry::{FunctionRecord, FunctionRegistry, NewFunction, RegistryError};
use crate::request::{
    ExecutionRequest, ExecutionResponse, ExecutionStatus, Language, Profile, RawExecutionRequest,
};

/// MCP server for sandboxed code execution.
#[derive(Clone)]
pub struct SandboxServer {
    engine: Arc<Engine>,
    registry: Arc<dyn FunctionRegistry>,
    history: Arc<dyn MetricsHistory>,
    tool_router: ToolRouter<Self>,
}

fn default_profile() -> String {
    Profile::Standard.as_str().to_string()
}

/// Parameters for the execute tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    /// Function the execution is attributed to (0 for ad-hoc code).
    #[serde(default)]
    #[schemars(description = "Function the execution is attributed to (0 for ad-hoc code)")]
    pub function_id: i64,

    #[schemars(description = "The code to execute in the sandbox")]
    pub code: String,

    #[schemars(description = "Language of the code: 'python' or 'javascript'")]
    pub language: String,

    #[schemars(description = "Wall-clock limit in milliseconds")]
    pub timeout_ms: i64,

    #[serde(default = "default_profile")]
    #[schemars(description = "Isolation profile: 'standard' or 'hardened'")]
    pub profile: String,
}

/// Parameters for the compare tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CompareParams {
    #[serde(default)]
    #[schemars(description = "Function the executions are attributed to (0 for ad-hoc code)")]
    pub function_id: i64,

    #[schemars(description = "The code to execute in the sandbox")]
    pub code: String,

    #[schemars(description = "Language of the code: 'python' or 'javascript'")]
    pub language: String,

    #[schemars(description = "Wall-clock limit in milliseconds")]
    pub timeout_ms: i64,

    /// Profiles to run; all of them when omitted.
    #[serde(default)]
    #[schemars(description = "Profiles to compare; all profiles when omitted")]
    pub profiles: Option<Vec<String>>,
}

/// Fields of a registered function.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct FunctionParams {
    #[schemars(description = "Human-readable function name")]
    pub name: String,

    #[schemars(description = "Unique route, starting with '/'")]
    pub route: String,

    #[schemars(description = "Source code of the function")]
    pub code: String,

    #[schemars(description = "Language of the code: 'python' or 'javascript'")]
    pub language: String,

    #[schemars(description = "Wall-clock limit in milliseconds")]
    pub timeout_ms: i64,
}

/// Parameters for the update_function tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdateFunctionParams {
    #[schemars(description = "Id of the function to replace")]
    pub id: i64,

    #[serde(flatten)]
    pub function: FunctionParams,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FunctionIdParams {
    #[schemars(description = "Function id")]
    pub id: i64,
}

/// Parameters for the run_function tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunFunctionParams {
    #[schemars(description = "Function id")]
    pub id: i64,

    #[serde(default)]
    #[schemars(description = "Profiles to run; all profiles when omitted")]
    pub profiles: Option<Vec<String>>,
}

/// Parameters for the function_metrics tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct FunctionMetricsParams {
    #[schemars(description = "Function id")]
    pub id: i64,

    #[serde(default)]
    #[schemars(description = "Inclusive lower bound, RFC 3339")]
    pub since: Option<String>,

    #[serde(default)]
    #[schemars(description = "Inclusive upper bound, RFC 3339")]
    pub until: Option<String>,
}

impl FunctionParams {
    fn into_new_function(self) -> Result<NewFunction, McpError> {
        let language = self.language.parse::<Language>().map_err(invalid)?;
        let timeout_ms = u64::try_from(self.timeout_ms)
            .map_err(|_| McpError::invalid_params("timeout_ms must be positive", None))?;
        Ok(NewFunction {
            name: self.name,
            route: self.route,
            code: self.code,
            language,
            timeout_ms,
        })
    }
}

fn invalid(e: impl std::fmt::Display) -> McpError {
    McpError::invalid_params(e.to_string(), None)
}

fn registry_error(e: RegistryError) -> McpError {
    McpError::invalid_params(e.to_string(), None)
}

/// Parse a profile list, keeping the first occurrence of each.
fn parse_profiles(profiles: Option<Vec<String>>) -> Result<Vec<Profile>, McpError> {
    let Some(names) = profiles.filter(|p| !p.is_empty()) else {
        return Ok(Profile::ALL.to_vec());
    };
    let mut parsed = Vec::with_capacity(names.len());
    for name in names {
        let profile = name.parse::<Profile>().map_err(invalid)?;
        if !parsed.contains(&profile) {
            parsed.push(profile);
        }
    }
    Ok(parsed)
}

fn parse_bound(bound: Option<String>) -> Result<Option<DateTime<Utc>>, McpError> {
    bound
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| McpError::invalid_params(format!("invalid timestamp '{s}': {e}"), None))
        })
        .transpose()
}

fn json<T: Serialize>(value: &T) -> Result<String, McpError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Failed to encode result: {e}"), None))
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(json(value)?)]))
}

#[tool_router]
impl SandboxServer {
    /// Create a new sandbox server.
    pub fn new(
        engine: Arc<Engine>,
        registry: Arc<dyn FunctionRegistry>,
        history: Arc<dyn MetricsHistory>,
    ) -> Self {
        Self {
            engine,
            registry,
            history,
            tool_router: Self::tool_router(),
        }
    }

    /// Execute code under one isolation profile.
    #[tool(description = "Execute Python or JavaScript code in a network-isolated sandbox and report time, memory and CPU. Runs with a non-zero function_id are recorded in that function's history")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        let request = ExecutionRequest::try_from(RawExecutionRequest {
            function_id: params.function_id,
            code: params.code,
            language: params.language,
            timeout_ms: params.timeout_ms,
            profile: params.profile,
        })
        .map_err(invalid)?;

        info!(code_len = request.code().len(), "Executing code");
        let response = self.engine.execute(&request).await;
        if request.function_id() != 0 {
            self.history
                .record(request.function_id(), request.profile(), &response)
                .await;
        }

        let text = json(&response)?;
        if response.status == ExecutionStatus::Success {
            Ok(CallToolResult::success(vec![Content::text(text)]))
        } else {
            Ok(CallToolResult::error(vec![Content::text(text)]))
        }
    }

    /// Run the same code under several profiles.
    #[tool(description = "Execute the same code under several isolation profiles, one after another, and compare the results")]
    async fn compare(
        &self,
        Parameters(params): Parameters<CompareParams>,
    ) -> Result<CallToolResult, McpError> {
        let profiles = parse_profiles(params.profiles)?;
        let request = ExecutionRequest::try_from(RawExecutionRequest {
            function_id: params.function_id,
            code: params.code,
            language: params.language,
            timeout_ms: params.timeout_ms,
            profile: default_profile(),
        })
        .map_err(invalid)?;

        let results = self.run_profiles(&request, &profiles).await;
        json_result(&results)
    }

    #[tool(description = "Report server liveness and whether the container runtime is reachable")]
    async fn health(&self) -> Result<CallToolResult, McpError> {
        json_result(&self.engine.health().await)
    }

    #[tool(description = "Register a function under a unique route")]
    async fn create_function(
        &self,
        Parameters(params): Parameters<FunctionParams>,
    ) -> Result<CallToolResult, McpError> {
        let record = self
            .registry
            .create(params.into_new_function()?)
            .await
            .map_err(registry_error)?;
        info!(id = record.id, route = %record.route, "Function created");
        json_result(&record)
    }

    #[tool(description = "Fetch a registered function")]
    async fn get_function(
        &self,
        Parameters(params): Parameters<FunctionIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let record = self.registry.get(params.id).await.map_err(registry_error)?;
        json_result(&record)
    }

    #[tool(description = "Replace a registered function")]
    async fn update_function(
        &self,
        Parameters(params): Parameters<UpdateFunctionParams>,
    ) -> Result<CallToolResult, McpError> {
        let record = self
            .registry
            .update(params.id, params.function.into_new_function()?)
            .await
            .map_err(registry_error)?;
        json_result(&record)
    }

    #[tool(description = "Delete a registered function")]
    async fn delete_function(
        &self,
        Parameters(params): Parameters<FunctionIdParams>,
    ) -> Result<CallToolResult, McpError> {
        self.registry
            .delete(params.id)
            .await
            .map_err(registry_error)?;
        info!(id = params.id, "Function deleted");
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Deleted function {}",
            params.id
        ))]))
    }

    #[tool(description = "List registered functions")]
    async fn list_functions(&self) -> Result<CallToolResult, McpError> {
        let functions: Vec<FunctionRecord> = self.registry.list().await;
        json_result(&functions)
    }

    /// Execute a registered function under each requested profile.
    #[tool(description = "Execute a registered function under one or more isolation profiles and record the results")]
    async fn run_function(
        &self,
        Parameters(params): Parameters<RunFunctionParams>,
    ) -> Result<CallToolResult, McpError> {
        let profiles = parse_profiles(params.profiles)?;
        let record = self.registry.get(params.id).await.map_err(registry_error)?;
        let request = ExecutionRequest::new(
            record.id,
            record.code,
            record.language,
            Duration::from_millis(record.timeout_ms),
            Profile::Standard,
        )
        .map_err(invalid)?;

        let results = self.run_profiles(&request, &profiles).await;
        json_result(&results)
    }

    #[tool(description = "Recorded executions of a function, oldest first, optionally bounded by RFC 3339 timestamps")]
    async fn function_metrics(
        &self,
        Parameters(params): Parameters<FunctionMetricsParams>,
    ) -> Result<CallToolResult, McpError> {
        let since = parse_bound(params.since)?;
        let until = parse_bound(params.until)?;
        let entries: Vec<HistoryEntry> = self.history.range(params.id, since, until).await;
        json_result(&entries)
    }
}

impl SandboxServer {
    /// Execute `request` once per profile and record each response.
    async fn run_profiles(
        &self,
        request: &ExecutionRequest,
        profiles: &[Profile],
    ) -> BTreeMap<&'static str, ExecutionResponse> {
        let mut results = BTreeMap::new();
        for (profile, response) in self.engine.compare(request, profiles).await {
            if response.status != ExecutionStatus::Success {
                error!(profile = %profile, status = ?response.status, "Profile run did not succeed");
            }
            self.history
                .record(request.function_id(), profile, &response)
                .await;
            results.insert(profile.as_str(), response);
        }
        results
    }
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "sandbox-exec-engine".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Execute untrusted code in network-isolated containers ({} runtime).\n\
                 \n\
                 Use the 'execute' tool with:\n\
                 - language: 'python' or 'javascript'\n\
                 - code: the code to run\n\
                 - timeout_ms: wall-clock limit\n\
                 - profile: 'standard' or 'hardened'\n\
                 \n\
                 Use 'compare' to run the same code under both profiles.",
                self.engine.runtime_name()
            )),
        }
    }
}

/// Serve the sandbox server over stdio.
pub async fn serve_stdio(
    engine: Arc<Engine>,
    registry: Arc<dyn FunctionRegistry>,
    history: Arc<dyn MetricsHistory>,
) -> anyhow::Result<()> {
    let server = SandboxServer::new(engine, registry, history);

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeExit, FakeRuntime};
    use crate::backend::CapturedOutput;
    use crate::config::Config;
    use crate::history::InMemoryHistory;
    use crate::registry::InMemoryRegistry;

    struct Fixture {
        server: SandboxServer,
        runtime: Arc<FakeRuntime>,
        registry: Arc<InMemoryRegistry>,
        history: Arc<InMemoryHistory>,
    }

    fn fixture(runtime: FakeRuntime) -> Fixture {
        let runtime = Arc::new(runtime);
        let engine = Arc::new(Engine::new(runtime.clone(), &Config::default()));
        let registry = Arc::new(InMemoryRegistry::new());
        let history = Arc::new(InMemoryHistory::new());
        Fixture {
            server: SandboxServer::new(engine, registry.clone(), history.clone()),
            runtime,
            registry,
            history,
        }
    }

    fn execute_params(language: &str, timeout_ms: i64, profile: &str) -> ExecuteParams {
        ExecuteParams {
            function_id: 0,
            code: "print('hi')".to_string(),
            language: language.to_string(),
            timeout_ms,
            profile: profile.to_string(),
        }
    }

    fn function_params(route: &str) -> FunctionParams {
        FunctionParams {
            name: "hello".to_string(),
            route: route.to_string(),
            code: "print('hi')".to_string(),
            language: "python".to_string(),
            timeout_ms: 5000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn execute_succeeds() {
        let f = fixture(FakeRuntime::new());
        let result = f
            .server
            .execute(Parameters(execute_params("python", 5000, "standard")))
            .await
            .unwrap();
        assert!(!result.is_error.unwrap_or(false));
        assert_eq!(f.runtime.launches(), 1);
        assert_eq!(f.runtime.live_sandboxes(), 0);
        // Ad-hoc code is not attributed to any function.
        assert!(f.history.range(0, None, None).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn execute_records_attributed_runs() {
        let f = fixture(FakeRuntime::new());
        let mut params = execute_params("python", 5000, "hardened");
        params.function_id = 5;
        f.server.execute(Parameters(params)).await.unwrap();

        let entries = f.history.range(5, None, None).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].profile, Profile::Hardened);
        assert_eq!(entries[0].response.status, ExecutionStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_failure_is_tool_error() {
        let f = fixture(FakeRuntime::new().with_exit(FakeExit::After {
            delay: Duration::from_millis(10),
            code: 1,
            output: CapturedOutput {
                stdout: String::new(),
                stderr: "ValueError: boom".into(),
            },
        }));
        let result = f
            .server
            .execute(Parameters(execute_params("python", 5000, "hardened")))
            .await
            .unwrap();
        assert!(result.is_error.unwrap_or(false));
    }

    #[tokio::test]
    async fn execute_malformed_requests() {
        let f = fixture(FakeRuntime::new());
        for params in [
            execute_params("ruby", 5000, "standard"),
            execute_params("python", 0, "standard"),
            execute_params("python", -5, "standard"),
            execute_params("python", 5000, "paranoid"),
        ] {
            assert!(f.server.execute(Parameters(params)).await.is_err());
        }
        assert_eq!(f.runtime.pings(), 0);
        assert_eq!(f.runtime.launches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn compare_records_each_profile() {
        let f = fixture(FakeRuntime::new());
        let params = CompareParams {
            function_id: 9,
            code: "print('hi')".to_string(),
            language: "python".to_string(),
            timeout_ms: 5000,
            profiles: None,
        };
        let result = f.server.compare(Parameters(params)).await.unwrap();
        assert!(!result.is_error.unwrap_or(false));

        let entries = f.history.range(9, None, None).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(f.runtime.launches(), 2);
        assert_eq!(f.runtime.live_sandboxes(), 0);
    }

    #[test]
    fn profiles_parse_and_dedupe() {
        assert_eq!(parse_profiles(None).unwrap(), Profile::ALL.to_vec());
        assert_eq!(
            parse_profiles(Some(vec!["hardened".into(), "hardened".into()])).unwrap(),
            vec![Profile::Hardened]
        );
        assert!(parse_profiles(Some(vec!["fast".into()])).is_err());
    }

    #[tokio::test]
    async fn health_does_not_launch() {
        let f = fixture(FakeRuntime::new().unreachable());
        let result = f.server.health().await.unwrap();
        assert!(!result.is_error.unwrap_or(false));
        assert_eq!(f.runtime.launches(), 0);
    }

    #[tokio::test]
    async fn function_crud() {
        let f = fixture(FakeRuntime::new());
        f.server
            .create_function(Parameters(function_params("/hello")))
            .await
            .unwrap();
        assert!(f
            .server
            .create_function(Parameters(function_params("/hello")))
            .await
            .is_err());

        let mut replacement = function_params("/greet");
        replacement.language = "javascript".to_string();
        f.server
            .update_function(Parameters(UpdateFunctionParams {
                id: 1,
                function: replacement,
            }))
            .await
            .unwrap();
        let record = f.registry.get(1).await.unwrap();
        assert_eq!(record.route, "/greet");
        assert_eq!(record.language, Language::Javascript);

        assert!(f
            .server
            .get_function(Parameters(FunctionIdParams { id: 1 }))
            .await
            .is_ok());
        f.server
            .delete_function(Parameters(FunctionIdParams { id: 1 }))
            .await
            .unwrap();
        assert!(f
            .server
            .get_function(Parameters(FunctionIdParams { id: 1 }))
            .await
            .is_err());
        assert!(f.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn create_function_rejects_bad_language() {
        let f = fixture(FakeRuntime::new());
        let mut params = function_params("/hello");
        params.language = "cobol".to_string();
        assert!(f.server.create_function(Parameters(params)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn run_function_and_metrics() {
        let f = fixture(FakeRuntime::new());
        f.server
            .create_function(Parameters(function_params("/hello")))
            .await
            .unwrap();

        f.server
            .run_function(Parameters(RunFunctionParams {
                id: 1,
                profiles: Some(vec!["hardened".to_string()]),
            }))
            .await
            .unwrap();

        let entries = f.history.range(1, None, None).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].profile, Profile::Hardened);
        assert_eq!(f.runtime.launched()[0].limits.cpu_quota, 40_000);

        let result = f
            .server
            .function_metrics(Parameters(FunctionMetricsParams {
                id: 1,
                since: Some("2020-01-01T00:00:00Z".to_string()),
                until: None,
            }))
            .await
            .unwrap();
        assert!(!result.is_error.unwrap_or(false));
    }

    #[tokio::test]
    async fn run_unknown_function() {
        let f = fixture(FakeRuntime::new());
        let result = f
            .server
            .run_function(Parameters(RunFunctionParams {
                id: 42,
                profiles: None,
            }))
            .await;
        assert!(result.is_err());
        assert_eq!(f.runtime.launches(), 0);
    }

    #[tokio::test]
    async fn function_metrics_rejects_bad_bound() {
        let f = fixture(FakeRuntime::new());
        let result = f
            .server
            .function_metrics(Parameters(FunctionMetricsParams {
                id: 1,
                since: Some("yesterday".to_string()),
                until: None,
            }))
            .await;
        assert!(result.is_err());
    }
}
