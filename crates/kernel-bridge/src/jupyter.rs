//! [`KernelSession`] over ZeroMQ for an already-running kernel.
//!
//! The session owns three tasks: a writer draining the outgoing queue onto
//! shell, a shell reader resolving execute replies, and an iopub router
//! that delivers output to execution streams by parent msg_id and comm
//! traffic to the comms it opened.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use anyhow::Context as _;
use bytes::Bytes;
use futures::channel::mpsc as futures_mpsc;
use futures::StreamExt;
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, ExecutionState, JupyterMessage, JupyterMessageContent,
    KernelInfoRequest, ShutdownRequest,
};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::BridgeConfig;
use crate::diagnostics::MessageTap;
use crate::error::{BridgeError, Result};
use crate::session::{
    Comm, CommOpenHandler, ExecutionFuture, KernelSession, MessageHandler, ReplySender,
};
use crate::wire::build_message;

/// Read a connection file, substituting `credential` for its key when given.
pub async fn load_connection_info(
    path: &Path,
    credential: Option<&str>,
) -> anyhow::Result<ConnectionInfo> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read connection file {}", path.display()))?;
    let mut connection_info = serde_json::from_str::<ConnectionInfo>(&content)
        .with_context(|| format!("Invalid connection file {}", path.display()))?;
    if let Some(key) = credential {
        connection_info.key = key.to_string();
    }
    Ok(connection_info)
}

type OpenHandler = Arc<dyn Fn(Arc<dyn Comm>, &JupyterMessage) + Send + Sync>;
type SharedHandler = Arc<dyn Fn(&JupyterMessage) + Send + Sync>;
type Outgoing = futures_mpsc::UnboundedSender<JupyterMessage>;

/// Routing tables shared by the session, its tasks and its comms.
struct Routes {
    executions: Mutex<HashMap<String, mpsc::UnboundedSender<JupyterMessage>>>,
    replies: Mutex<HashMap<String, ReplySender>>,
    comms: Mutex<HashMap<String, Arc<KernelComm>>>,
    targets: Mutex<HashMap<String, OpenHandler>>,
    outgoing: Outgoing,
    tap: Option<Arc<dyn MessageTap>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Routes {
    fn send(&self, message: JupyterMessage) -> Result<()> {
        if let Some(tap) = &self.tap {
            tap.observe("out", "shell", &message);
        }
        self.outgoing
            .unbounded_send(message)
            .map_err(|_| BridgeError::ConnectionClosed)
    }

    /// Drop every pending execution; streams end and replies fail.
    fn abandon(&self) {
        lock(&self.executions).clear();
        lock(&self.replies).clear();
    }

    fn route_iopub(self: &Arc<Self>, message: JupyterMessage) {
        if let Some(tap) = &self.tap {
            tap.observe("in", "iopub", &message);
        }

        let idle = match &message.content {
            JupyterMessageContent::CommOpen(open) => {
                let comm_id = open.comm_id.0.clone();
                let handler = lock(&self.targets).get(&open.target_name).cloned();
                let Some(handler) = handler else {
                    warn!(
                        "[session] No handler for comm target {}, closing {}",
                        open.target_name, comm_id
                    );
                    let reply = build_message("comm_close", json!({"comm_id": comm_id, "data": {}}));
                    match reply {
                        Ok(mut reply) => {
                            reply.parent_header = Some(message.header.clone());
                            if let Err(e) = self.send(reply) {
                                debug!("[session] Could not close {}: {}", comm_id, e);
                            }
                        }
                        Err(e) => error!("[session] Failed to build comm_close: {}", e),
                    }
                    return;
                };

                let comm = Arc::new(KernelComm {
                    comm_id: comm_id.clone(),
                    target_name: open.target_name.clone(),
                    routes: Arc::downgrade(self),
                    closed: AtomicBool::new(false),
                    on_msg: Mutex::new(None),
                    on_close: Mutex::new(None),
                });
                lock(&self.comms).insert(comm_id, comm.clone());
                handler(comm as Arc<dyn Comm>, &message);
                return;
            }
            JupyterMessageContent::CommMsg(msg) => {
                let comm = lock(&self.comms).get(&msg.comm_id.0).cloned();
                match comm {
                    Some(comm) => comm.deliver(&message),
                    None => debug!("[session] comm_msg for unknown comm {}", msg.comm_id.0),
                }
                return;
            }
            JupyterMessageContent::CommClose(close) => {
                let comm = lock(&self.comms).remove(&close.comm_id.0);
                if let Some(comm) = comm {
                    comm.closed.store(true, Ordering::SeqCst);
                    comm.notify_close(&message);
                }
                return;
            }
            JupyterMessageContent::Status(status) => status.execution_state == ExecutionState::Idle,
            _ => false,
        };

        let Some(parent_id) = message.parent_header.as_ref().map(|h| h.msg_id.clone()) else {
            return;
        };
        let mut executions = lock(&self.executions);
        if let Some(outputs) = executions.get(&parent_id) {
            let _ = outputs.send(message);
        }
        if idle {
            executions.remove(&parent_id);
        }
    }

    fn route_shell(&self, message: JupyterMessage) {
        if let Some(tap) = &self.tap {
            tap.observe("in", "shell", &message);
        }
        let JupyterMessageContent::ExecuteReply(reply) = &message.content else {
            debug!("[session] shell reply: type={}", message.header.msg_type);
            return;
        };
        let Some(parent_id) = message.parent_header.as_ref().map(|h| &h.msg_id) else {
            return;
        };
        if let Some(sender) = lock(&self.replies).remove(parent_id) {
            let _ = sender.send(Ok(reply.status.clone()));
        }
    }
}

/// A comm opened by the kernel on this session.
struct KernelComm {
    comm_id: String,
    target_name: String,
    routes: Weak<Routes>,
    closed: AtomicBool,
    on_msg: Mutex<Option<SharedHandler>>,
    on_close: Mutex<Option<SharedHandler>>,
}

impl KernelComm {
    fn deliver(&self, message: &JupyterMessage) {
        let handler = lock(&self.on_msg).clone();
        if let Some(handler) = handler {
            handler(message);
        }
    }

    fn notify_close(&self, message: &JupyterMessage) {
        let handler = lock(&self.on_close).take();
        if let Some(handler) = handler {
            handler(message);
        }
    }

    fn routes(&self) -> Result<Arc<Routes>> {
        self.routes.upgrade().ok_or(BridgeError::ConnectionClosed)
    }
}

impl Comm for KernelComm {
    fn comm_id(&self) -> &str {
        &self.comm_id
    }

    fn target_name(&self) -> &str {
        &self.target_name
    }

    fn send(&self, data: Value, metadata: Value, buffers: Vec<Bytes>) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::CommClosed(self.comm_id.clone()));
        }
        let mut message = build_message("comm_msg", json!({"comm_id": self.comm_id, "data": data}))?;
        message.metadata = metadata;
        message.buffers = buffers;
        self.routes()?.send(message)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let message = build_message("comm_close", json!({"comm_id": self.comm_id, "data": {}}))?;
        let routes = self.routes()?;
        lock(&routes.comms).remove(&self.comm_id);
        let sent = routes.send(message.clone());
        self.notify_close(&message);
        sent
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn on_msg(&self, handler: MessageHandler) {
        *lock(&self.on_msg) = Some(Arc::from(handler));
    }

    fn on_close(&self, handler: MessageHandler) {
        *lock(&self.on_close) = Some(Arc::from(handler));
    }
}

pub struct JupyterSession {
    session_id: String,
    connection_info: ConnectionInfo,
    language: Option<String>,
    routes: Arc<Routes>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_kernel: bool,
}

impl JupyterSession {
    /// Attach to the kernel described by `connection_info`.
    pub async fn connect(
        connection_info: ConnectionInfo,
        config: &BridgeConfig,
        tap: Option<Arc<dyn MessageTap>>,
    ) -> anyhow::Result<Self> {
        // ZeroMQ connects never fail fast; a stale connection file only
        // shows up as an unanswered heartbeat.
        let mut heartbeat = runtimelib::create_client_heartbeat_connection(&connection_info)
            .await
            .context("Failed to connect heartbeat")?;
        tokio::time::timeout(config.heartbeat_timeout(), heartbeat.single_heartbeat())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Kernel did not answer heartbeat within {:?}; it may have exited",
                    config.heartbeat_timeout()
                )
            })?
            .context("Kernel heartbeat failed")?;

        let session_id = format!("bridge-{}", uuid::Uuid::new_v4());

        let mut iopub =
            runtimelib::create_client_iopub_connection(&connection_info, "", &session_id)
                .await
                .context("Failed to connect iopub")?;

        let identity = runtimelib::peer_identity_for_session(&session_id)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &session_id,
            identity,
        )
        .await
        .context("Failed to connect shell")?;

        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await?;
        let reply = tokio::time::timeout(config.kernel_info_timeout(), shell.read())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Kernel did not answer kernel_info_request within {:?}",
                    config.kernel_info_timeout()
                )
            })?
            .context("Failed to read kernel_info_reply")?;
        let language = match &reply.content {
            JupyterMessageContent::KernelInfoReply(info) => Some(info.language_info.name.clone()),
            _ => None,
        };
        info!(
            "[session] Kernel alive: got {} (language {:?})",
            reply.header.msg_type, language
        );

        let (mut shell_writer, mut shell_reader) = shell.split();
        let (outgoing, mut rx) = futures_mpsc::unbounded::<JupyterMessage>();

        let routes = Arc::new(Routes {
            executions: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
            comms: Mutex::new(HashMap::new()),
            targets: Mutex::new(HashMap::new()),
            outgoing,
            tap,
        });

        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.next().await {
                if let Err(e) = shell_writer.send(message).await {
                    error!("[session] Failed to send on shell: {}", e);
                }
            }
        });

        let shell_routes = routes.clone();
        let shell_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(message) => shell_routes.route_shell(message),
                    Err(e) => {
                        error!("[session] shell read error: {}", e);
                        break;
                    }
                }
            }
            shell_routes.abandon();
        });

        let iopub_routes = routes.clone();
        let iopub_task = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => iopub_routes.route_iopub(message),
                    Err(e) => {
                        error!("[session] iopub read error: {}", e);
                        break;
                    }
                }
            }
            iopub_routes.abandon();
        });

        info!("[session] Connected {}", session_id);
        Ok(Self {
            session_id,
            connection_info,
            language,
            routes,
            tasks: Mutex::new(vec![writer_task, shell_task, iopub_task]),
            shutdown_kernel: config.shutdown_kernel_on_teardown,
        })
    }

    /// Kernel language reported by kernel_info.
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    fn stop_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl KernelSession for JupyterSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn execute(&self, code: &str) -> Result<ExecutionFuture> {
        let message: JupyterMessage = ExecuteRequest::new(code.to_string()).into();
        let msg_id = message.header.msg_id.clone();
        let (future, outputs, reply) = ExecutionFuture::channel(msg_id.clone());

        // Register before sending so early iopub output finds its stream
        lock(&self.routes.executions).insert(msg_id.clone(), outputs);
        lock(&self.routes.replies).insert(msg_id.clone(), reply);

        if let Err(e) = self.routes.send(message) {
            lock(&self.routes.executions).remove(&msg_id);
            lock(&self.routes.replies).remove(&msg_id);
            return Err(e);
        }
        debug!("[session] Sent execute_request: msg_id={}", msg_id);
        Ok(future)
    }

    fn register_comm_target(&self, target_name: &str, handler: CommOpenHandler) {
        lock(&self.routes.targets).insert(target_name.to_string(), Arc::from(handler));
    }

    fn shutdown(&self) {
        self.stop_tasks();
        self.routes.abandon();
        lock(&self.routes.comms).clear();
        self.routes.outgoing.close_channel();

        if !self.shutdown_kernel {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("[session] No runtime available to send shutdown_request");
            return;
        };
        let connection_info = self.connection_info.clone();
        let session_id = self.session_id.clone();
        handle.spawn(async move {
            let control =
                runtimelib::create_client_control_connection(&connection_info, &session_id).await;
            match control {
                Ok(mut control) => {
                    let request: JupyterMessage = ShutdownRequest { restart: false }.into();
                    if let Err(e) = control.send(request).await {
                        warn!("[session] Failed to send shutdown_request: {}", e);
                    } else {
                        info!("[session] Sent shutdown_request");
                    }
                }
                Err(e) => warn!("[session] Failed to connect control: {}", e),
            }
        });
    }
}

impl Drop for JupyterSession {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}
