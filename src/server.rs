//! Request server — TCP accept loop, sessions, and command dispatch
//!
//! One task accepts connections; each accepted client gets its own session
//! task running a strict request/reply loop. Sessions start
//! unauthenticated and are upgraded by a successful `Login`. A slow client
//! stalls only its own session.

use crate::auth::{CredentialStore, Role};
use crate::groups::GroupIndex;
use crate::history::HistoryRing;
use crate::probe::{ProbeError, ProcessProbe};
use crate::protocol::{self, FrameError};
use crate::registry::Registry;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a session needs to answer requests, built once at startup.
pub struct ServerState {
    pub registry: Arc<Registry>,
    pub history: Arc<HistoryRing>,
    pub groups: Arc<GroupIndex>,
    pub credentials: Arc<CredentialStore>,
    pub probe: Arc<dyn ProcessProbe>,
}

/// Per-connection authentication state.
struct Session {
    role: Option<Role>,
}

pub struct Server {
    state: Arc<ServerState>,
    max_clients: usize,
}

impl Server {
    pub fn new(state: Arc<ServerState>, max_clients: usize) -> Self {
        Self { state, max_clients }
    }

    /// Bind the listening socket. Failing here is fatal for the daemon.
    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind listen socket on {addr}"))
    }

    /// Accept clients until cancelled. Connections beyond the client cap
    /// are closed immediately without a reply.
    pub async fn run(self, listener: TcpListener, cancel: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!("listening on {addr}");
        }
        let limiter = Arc::new(Semaphore::new(self.max_clients));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    match limiter.clone().try_acquire_owned() {
                        Ok(permit) => {
                            let state = self.state.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                handle_session(state, stream, peer, cancel).await;
                                drop(permit);
                            });
                        }
                        Err(_) => {
                            warn!("client limit reached, rejecting {peer}");
                            drop(stream);
                        }
                    }
                }
            }
        }
    }
}

/// Serial request/reply loop for one client.
async fn handle_session(
    state: Arc<ServerState>,
    mut stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    debug!("client connected: {peer}");
    let mut session = Session { role: None };

    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = protocol::read_frame(&mut stream) => match frame {
                Ok(payload) => payload,
                Err(FrameError::Closed) => {
                    debug!("client disconnected: {peer}");
                    break;
                }
                Err(e) => {
                    // Framing violations close the session with no reply.
                    debug!("closing session {peer}: {e}");
                    break;
                }
            }
        };

        let reply = dispatch(&state, &mut session, &payload).await;
        let bytes = match serde_json::to_vec(&reply) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to encode reply for {peer}: {e}");
                break;
            }
        };
        if let Err(e) = protocol::write_frame(&mut stream, &bytes).await {
            debug!("write to {peer} failed: {e}");
            break;
        }
    }
}

fn requires_admin(command: &str) -> bool {
    matches!(
        command,
        "SuspendProcess"
            | "ResumeProcess"
            | "TerminateProcess"
            | "AdjustPriority"
            | "CreateGroup"
            | "DeleteGroup"
            | "RenameGroup"
            | "AddProcessToGroup"
            | "RemoveProcessFromGroup"
    )
}

fn parse_params<T: serde::de::DeserializeOwned>(command: &str, request: &Value) -> Result<T, Value> {
    serde_json::from_value(request.clone())
        .map_err(|_| protocol::error(command, "missing or invalid parameters"))
}

/// Parse one request and produce its reply. Never fails: every outcome is
/// a reply object echoing the command (or `"error"` when the command could
/// not be determined).
async fn dispatch(state: &ServerState, session: &mut Session, payload: &[u8]) -> Value {
    let request: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(_) => return protocol::error("error", "invalid request"),
    };
    let Some(command) = request
        .get("command")
        .and_then(Value::as_str)
        .map(str::to_owned)
    else {
        return protocol::error("error", "invalid request");
    };

    if command == "Login" {
        return login(state, session, &command, &request);
    }

    let Some(role) = session.role else {
        return protocol::error(&command, "not authenticated");
    };
    if requires_admin(&command) && role != Role::Admin {
        return protocol::error(&command, "insufficient privilege");
    }

    match command.as_str() {
        "GetProcesses" => get_processes(state, &command).await,
        "GetSimpleProcessDetails" => match parse_params::<protocol::PidParams>(&command, &request) {
            Ok(params) => simple_details(state, &command, params.pid).await,
            Err(reply) => reply,
        },
        "GetDetailedProcessDetails" => {
            match parse_params::<protocol::PidParams>(&command, &request) {
                Ok(params) => detailed_details(state, &command, params.pid).await,
                Err(reply) => reply,
            }
        }
        "SuspendProcess" => match parse_params::<protocol::PidParams>(&command, &request) {
            Ok(params) => control_reply(&command, params.pid, state.probe.suspend(params.pid)),
            Err(reply) => reply,
        },
        "ResumeProcess" => match parse_params::<protocol::PidParams>(&command, &request) {
            Ok(params) => control_reply(&command, params.pid, state.probe.resume(params.pid)),
            Err(reply) => reply,
        },
        "TerminateProcess" => match parse_params::<protocol::PidParams>(&command, &request) {
            Ok(params) => control_reply(&command, params.pid, state.probe.terminate(params.pid)),
            Err(reply) => reply,
        },
        "AdjustPriority" => {
            match parse_params::<protocol::AdjustPriorityParams>(&command, &request) {
                Ok(params) => control_reply(
                    &command,
                    params.pid,
                    state
                        .registry
                        .adjust_priority(params.pid, params.priority, params.policy),
                ),
                Err(reply) => reply,
            }
        }
        "GetGroups" => get_groups(state, &command).await,
        "CreateGroup" => match parse_params::<protocol::CreateGroupParams>(&command, &request) {
            Ok(params) => {
                let id = state
                    .groups
                    .create_group(&params.name, params.priority, &params.description)
                    .await;
                protocol::success(&command, json!({ "group_id": id }))
            }
            Err(reply) => reply,
        },
        "DeleteGroup" => match parse_params::<protocol::GroupIdParams>(&command, &request) {
            Ok(params) => {
                let ok = state.groups.delete_group(params.group_id).await;
                group_reply(&command, json!({ "group_id": params.group_id }), ok, "unknown group")
            }
            Err(reply) => reply,
        },
        "RenameGroup" => match parse_params::<protocol::RenameGroupParams>(&command, &request) {
            Ok(params) => {
                let ok = state.groups.rename_group(params.group_id, &params.name).await;
                group_reply(&command, json!({ "group_id": params.group_id }), ok, "unknown group")
            }
            Err(reply) => reply,
        },
        "AddProcessToGroup" => {
            match parse_params::<protocol::GroupMemberParams>(&command, &request) {
                Ok(params) => {
                    let ok = state.groups.add(params.pid, params.group_id).await;
                    group_reply(
                        &command,
                        json!({ "pid": params.pid, "group_id": params.group_id }),
                        ok,
                        "unknown group or process",
                    )
                }
                Err(reply) => reply,
            }
        }
        "RemoveProcessFromGroup" => {
            match parse_params::<protocol::GroupMemberParams>(&command, &request) {
                Ok(params) => {
                    let ok = state.groups.remove(params.pid, params.group_id).await;
                    group_reply(
                        &command,
                        json!({ "pid": params.pid, "group_id": params.group_id }),
                        ok,
                        "not a member",
                    )
                }
                Err(reply) => reply,
            }
        }
        unknown => protocol::error(&command, format!("unknown command: {unknown}")),
    }
}

fn login(state: &ServerState, session: &mut Session, command: &str, request: &Value) -> Value {
    let params: protocol::LoginParams = match parse_params(command, request) {
        Ok(params) => params,
        Err(reply) => return reply,
    };
    match state.credentials.validate(&params.username, &params.password) {
        Some(role) => {
            session.role = Some(role);
            info!("user {} authenticated as {}", params.username, role.as_str());
            protocol::success(
                command,
                json!({ "authenticated": true, "role": role.as_str() }),
            )
        }
        None => {
            warn!("failed login attempt for {}", params.username);
            protocol::success(command, json!({ "authenticated": false }))
        }
    }
}

async fn get_processes(state: &ServerState, command: &str) -> Value {
    let mut pids: Vec<i32> = state
        .registry
        .snapshot_all()
        .await
        .iter()
        .map(|r| r.snapshot.pid)
        .collect();
    pids.sort_unstable();
    protocol::success(command, json!({ "pids": pids }))
}

async fn simple_details(state: &ServerState, command: &str, pid: i32) -> Value {
    let Some(record) = state.registry.get(pid).await else {
        return protocol::error(command, "process not found");
    };
    let uptime_ms = if record.snapshot.start_time_ms > 0 {
        (chrono::Utc::now().timestamp_millis() - record.snapshot.start_time_ms).max(0)
    } else {
        0
    };
    protocol::success(
        command,
        json!({
            "pid": pid,
            "name": record.snapshot.name,
            "cpu_usage": record.cpu_percent,
            "ram_usage": record.snapshot.memory_bytes,
            "uptime_ms": uptime_ms,
        }),
    )
}

/// Push the current sample first so a client polling only this command
/// still accumulates history, then return what the ring holds.
async fn detailed_details(state: &ServerState, command: &str, pid: i32) -> Value {
    let record = state.registry.get(pid).await;
    if let Some(record) = &record {
        state
            .history
            .push(pid, record.cpu_percent, record.snapshot.memory_bytes);
    }
    let entries = state.history.get(pid);
    if record.is_none() && entries.is_empty() {
        return protocol::error(command, "process not found");
    }
    protocol::success(command, json!({ "pid": pid, "entries": entries }))
}

async fn get_groups(state: &ServerState, command: &str) -> Value {
    let groups: Vec<Value> = state
        .groups
        .list()
        .await
        .iter()
        .map(|g| {
            json!({
                "id": g.id,
                "name": g.name,
                "priority": g.priority,
                "description": g.description,
                "process_count": g.members.len(),
                "total_cpu": g.total_cpu,
                "total_memory": g.total_memory,
            })
        })
        .collect();
    protocol::success(command, json!({ "groups": groups }))
}

/// Control operations report the OS outcome in-band: the reply is a
/// success envelope whose `success` field carries the verdict.
fn control_reply(command: &str, pid: i32, result: Result<(), ProbeError>) -> Value {
    match result {
        Ok(()) => protocol::success(command, json!({ "pid": pid, "success": true })),
        Err(ProbeError::NotFound) => protocol::success(
            command,
            json!({ "pid": pid, "success": false, "message": "process not found" }),
        ),
        Err(e) => protocol::success(
            command,
            json!({ "pid": pid, "success": false, "message": e.to_string() }),
        ),
    }
}

fn group_reply(command: &str, mut fields: Value, ok: bool, failure: &str) -> Value {
    if let Some(map) = fields.as_object_mut() {
        map.insert("success".to_string(), json!(ok));
        if !ok {
            map.insert("message".to_string(), json!(failure));
        }
    }
    protocol::success(command, fields)
}
