use super::{Connection, SessionInfo, TransportInfo, CLIENT_VERSION};
use crate::config::{ConduitConfig, StdioSettings, TransportType};
use crate::error::{McpError, Result};
use crate::mcp::codec;
use crate::mcp::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ToolDescriptor};
use crate::process::{ManagedProcess, ProcessStatus, ProcessSupervisor};
use crate::utils::logging::truncate_for_log;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Newline-delimited JSON-RPC over a supervised child process
pub struct StdioConnection {
    configuration_id: String,
    command_line: String,
    supervisor: ProcessSupervisor,
    request_timeout: Duration,
    client_name: String,
    connected: bool,
    session: Option<SessionInfo>,
}

impl StdioConnection {
    pub fn new(configuration_id: &str, settings: StdioSettings, config: &ConduitConfig) -> Self {
        Self {
            configuration_id: configuration_id.to_string(),
            command_line: settings.command_line(),
            supervisor: ProcessSupervisor::new(settings, config.process.clone()),
            request_timeout: config.request_timeout,
            client_name: config.client_name.clone(),
            connected: false,
            session: None,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }
}

/// Write `request` and read stdout until the response with its id arrives
async fn round_trip(process: &mut ManagedProcess, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
    let line = serde_json::to_string(request)?;
    debug!(pid = process.pid(), request = %truncate_for_log(&line, 1000), "Sending to MCP server");
    process.write_line(&line).await?;

    loop {
        let line = process
            .read_line()
            .await?
            .ok_or_else(|| McpError::connection("MCP server closed stdout"))?;
        let trimmed = line.trim();

        // Servers occasionally print banners or logs to stdout
        if !trimmed.starts_with('{') {
            if !trimmed.is_empty() {
                debug!(pid = process.pid(), line = %truncate_for_log(trimmed, 200), "Skipping non-JSON stdout line");
            }
            continue;
        }

        match codec::decode_message(trimmed)? {
            Some(response) if response.id == request.id => return Ok(response),
            Some(response) => {
                debug!(pid = process.pid(), id = %response.id, "Ignoring response for another request");
            }
            None => {}
        }
    }
}

async fn handshake(process: &mut ManagedProcess, client_name: &str) -> Result<SessionInfo> {
    let request = codec::initialize_request(client_name, CLIENT_VERSION);
    let response = round_trip(process, &request).await?;
    let result = codec::parse_initialize(codec::into_result(response)?)?;
    process.capabilities = Some(result.capabilities.clone());

    let notification = serde_json::to_string(&codec::initialized_notification())?;
    process.write_line(&notification).await?;
    Ok(SessionInfo::from(result))
}

#[async_trait]
impl Connection for StdioConnection {
    async fn connect(&mut self) -> Result<()> {
        let request_timeout = self.request_timeout;
        let process = self.supervisor.ensure_running().await?;

        if process.status() == ProcessStatus::Starting {
            match timeout(request_timeout, handshake(process, &self.client_name)).await {
                Ok(Ok(session)) => {
                    self.supervisor.mark_ready()?;
                    info!(
                        configuration_id = %self.configuration_id,
                        server = ?session.server_name,
                        "Stdio MCP server ready"
                    );
                    self.session = Some(session);
                }
                Ok(Err(error)) => {
                    self.supervisor.fail_current("handshake failed").await;
                    return Err(error);
                }
                Err(_) => {
                    self.supervisor.fail_current("handshake timed out").await;
                    return Err(McpError::timeout(request_timeout));
                }
            }
        }

        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.supervisor.status().is_some() {
            self.supervisor.shutdown().await;
        }
        self.connected = false;
        self.session = None;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_authenticated(&self) -> bool {
        true
    }

    async fn send_request(&mut self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        if !self.connected {
            return Err(McpError::connection("stdio connection is not established"));
        }
        let request_timeout = self.request_timeout;
        let process = self
            .supervisor
            .process_mut()
            .ok_or_else(|| McpError::connection("no MCP server process"))?;

        if !process.process_alive() {
            let exit_status = process.exit_status();
            self.connected = false;
            return Err(McpError::connection(format!(
                "MCP server process exited (status {:?})",
                exit_status
            )));
        }

        match timeout(request_timeout, round_trip(process, request)).await {
            Ok(Ok(response)) => {
                process.touch();
                Ok(response)
            }
            Ok(Err(error)) => {
                if error.is_connection_failure() {
                    self.connected = false;
                }
                Err(error)
            }
            Err(_) => {
                self.connected = false;
                self.supervisor.fail_current("request timed out").await;
                Err(McpError::timeout(request_timeout))
            }
        }
    }

    async fn send_notification(&mut self, notification: &JsonRpcNotification) -> Result<()> {
        let line = serde_json::to_string(notification)?;
        match self.supervisor.process_mut() {
            Some(process) if self.connected => process.write_line(&line).await,
            _ => Err(McpError::connection("stdio connection is not established")),
        }
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: TransportType::Stdio,
            endpoint: self.command_line.clone(),
            supports_reconnection: true,
        }
    }

    fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    fn is_stale(&self) -> bool {
        self.supervisor.is_stale()
    }

    fn record_tools(&mut self, tools: &[ToolDescriptor]) {
        if let Some(process) = self.supervisor.process_mut() {
            process.tools = Some(tools.to_vec());
        }
    }
}
