//! Biff MCP server.
//!
//! Exposes the biff presence and messaging tools over the MCP tool-call
//! protocol. One server process runs beside each coding session, owns
//! one `{user}:{tty}` session key, and talks to teammates through the
//! shared relay selected by configuration.
//!
//! The `read_messages` tool description is dynamic: `list_tools` renders
//! it from the awareness engine's cached unread summary, and a
//! `tools/list_changed` notification tells the client to re-fetch
//! whenever that summary changes.

use std::sync::Arc;

use rmcp::{
    model::*,
    schemars,
    service::{RequestContext, RoleServer},
    ErrorData as McpError, ServerHandler,
};
use serde::de::DeserializeOwned;

pub mod awareness;
pub mod doctor;
pub mod format;
pub mod install;
pub mod lifecycle;
pub mod state;
pub mod statusline;
pub mod tools;

pub use state::ServerState;

use crate::awareness::read_messages_description;
use crate::tools::{FingerParams, LastParams, MesgParams, PlanParams, TtyParams, WriteParams};

/// MCP server handle; cheap to clone, all state behind one `Arc`.
#[derive(Clone)]
pub struct BiffServer {
    state: Arc<ServerState>,
}

impl BiffServer {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    fn tool<T: schemars::JsonSchema>(name: &'static str, description: String) -> Tool {
        let schema = schemars::schema_for!(T);
        let schema_json = serde_json::to_value(schema).unwrap_or_default();
        let input_schema = match schema_json {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };
        Tool {
            name: name.into(),
            title: None,
            description: Some(description.into()),
            input_schema,
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }

    fn no_input_tool(name: &'static str, description: String) -> Tool {
        let mut map = serde_json::Map::new();
        map.insert("type".to_string(), serde_json::Value::String("object".to_string()));
        map.insert(
            "properties".to_string(),
            serde_json::Value::Object(serde_json::Map::new()),
        );
        Tool {
            name: name.into(),
            title: None,
            description: Some(description.into()),
            input_schema: Arc::new(map),
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }

    fn tool_list(&self) -> Vec<Tool> {
        let unread = self.state.awareness.current_summary();
        vec![
            Self::tool::<PlanParams>(
                "plan",
                "Set what you're currently working on. Visible to teammates via who and finger."
                    .to_string(),
            ),
            Self::tool::<MesgParams>(
                "mesg",
                "Control message reception. Use true to accept messages, false to mute them."
                    .to_string(),
            ),
            Self::no_input_tool(
                "who",
                "List all active team members and what they're working on.".to_string(),
            ),
            Self::tool::<FingerParams>(
                "finger",
                "Check what a user is working on and their availability.".to_string(),
            ),
            Self::tool::<WriteParams>(
                "write",
                "Send a message to a teammate. Address 'user' reaches any of their sessions, \
                 'user:tty' one specific session."
                    .to_string(),
            ),
            Self::no_input_tool("read_messages", read_messages_description(&unread)),
            Self::tool::<LastParams>(
                "last",
                "Show session login/logout history (like Unix last).".to_string(),
            ),
            Self::tool::<TtyParams>(
                "tty",
                "Name the current session. Visible in the who and last TTY columns.".to_string(),
            ),
        ]
    }
}

fn parse_params<T: DeserializeOwned>(args: JsonObject) -> Result<T, McpError> {
    serde_json::from_value(serde_json::Value::Object(args))
        .map_err(|err| McpError::invalid_params(format!("Invalid parameters: {err}"), None))
}

impl ServerHandler for BiffServer {
    fn get_info(&self) -> ServerInfo {
        let mut capabilities = ServerCapabilities::builder().enable_tools().build();
        if let Some(tools) = capabilities.tools.as_mut() {
            tools.list_changed = Some(true);
        }
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities,
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Biff is a communication tool for the engineers and agents sharing this \
                 repository. Use these tools to send messages, check presence, and coordinate \
                 with your team. Tool results are pre-formatted terminal output: repeat them \
                 verbatim instead of reformatting or summarizing them."
                    .to_string(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.tool_list(),
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let state = &self.state;

        // The poller sends notifications through the most recent request
        // peer; refresh it on every call in case the client reconnected.
        state.awareness.capture_peer(context.peer.clone());

        tools::heartbeat(state).await;

        let args = request.arguments.unwrap_or_default();
        let text = match request.name.as_ref() {
            "plan" => tools::plan(state, parse_params(args)?).await,
            "mesg" => tools::mesg(state, parse_params(args)?).await,
            "who" => tools::who(state).await,
            "finger" => tools::finger(state, parse_params(args)?).await,
            "write" => tools::write(state, parse_params(args)?).await,
            "read_messages" => tools::read_messages(state).await,
            "last" => tools::last(state, parse_params(args)?).await,
            "tty" => tools::tty(state, parse_params(args)?).await,
            other => {
                return Err(McpError::invalid_params(
                    format!("Unknown tool: {other}"),
                    None,
                ))
            }
        };

        // Belt: one synchronous awareness refresh in the happy path.
        let login = state.login().to_string();
        state
            .awareness
            .refresh(state.relay.as_ref(), &login, &state.tty)
            .await;

        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}
