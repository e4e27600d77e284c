//! Execution coordinator: one "run code" action end to end.
//!
//! `execute` clears the output sink, submits the code, binds the sink to a
//! fresh generation and spawns a driver task that routes the request's
//! output messages in order. Output that arrives after a newer execution
//! took over the sink is dropped by the generation check.

use std::sync::Arc;

use jupyter_protocol::{JupyterMessage, ReplyStatus};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::context::{CurrentExecution, SessionContext};
use crate::diagnostics::MessageTap;
use crate::error::{BridgeError, Result};
use crate::hydrator::WidgetHydrator;
use crate::output::OutputSink;
use crate::session::ExecutionFuture;

/// How an execution ended.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The kernel replied. `status` may still be error or aborted.
    Completed {
        status: ReplyStatus,
        /// Messages applied to the sink.
        routed: usize,
        /// Messages dropped because the sink had moved on.
        discarded: usize,
    },
    /// The connection failed before a reply arrived.
    Failed {
        error: BridgeError,
        routed: usize,
        discarded: usize,
    },
}

impl ExecutionOutcome {
    pub fn status(&self) -> Option<&ReplyStatus> {
        match self {
            ExecutionOutcome::Completed { status, .. } => Some(status),
            ExecutionOutcome::Failed { .. } => None,
        }
    }

    pub fn routed(&self) -> usize {
        match self {
            ExecutionOutcome::Completed { routed, .. } | ExecutionOutcome::Failed { routed, .. } => {
                *routed
            }
        }
    }

    pub fn discarded(&self) -> usize {
        match self {
            ExecutionOutcome::Completed { discarded, .. }
            | ExecutionOutcome::Failed { discarded, .. } => *discarded,
        }
    }
}

/// Handle to a submitted execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    generation: u64,
    msg_id: String,
    task: JoinHandle<ExecutionOutcome>,
}

impl ExecutionHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// Wait for the driver to route every output and observe the reply.
    pub async fn wait(self) -> ExecutionOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    "[coordinator] Driver for {} did not finish: {}",
                    self.msg_id, e
                );
                ExecutionOutcome::Failed {
                    error: BridgeError::ConnectionClosed,
                    routed: 0,
                    discarded: 0,
                }
            }
        }
    }
}

pub struct ExecutionCoordinator {
    context: Arc<SessionContext>,
    hydrator: Arc<WidgetHydrator>,
    tap: Option<Arc<dyn MessageTap>>,
}

impl ExecutionCoordinator {
    pub fn new(context: Arc<SessionContext>, hydrator: WidgetHydrator) -> Self {
        Self {
            context,
            hydrator: Arc::new(hydrator),
            tap: None,
        }
    }

    /// Observe every output message before routing.
    pub fn with_tap(mut self, tap: Arc<dyn MessageTap>) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    /// Submit `code` to the active session and route its output.
    ///
    /// Must be called from within a tokio runtime.
    pub fn execute(&self, code: &str) -> Result<ExecutionHandle> {
        let Some(session) = self.context.session() else {
            error!("[coordinator] Cannot execute: kernel not initialized");
            return Err(BridgeError::KernelNotInitialized);
        };
        let Some(sink) = self.context.output() else {
            error!("[coordinator] Cannot execute: output not initialized");
            return Err(BridgeError::OutputNotInitialized);
        };

        sink.clear();
        let generation = self.context.next_generation();

        let future = match session.execute(code) {
            Ok(future) => future,
            Err(e) => {
                error!("[coordinator] Failed to submit execute_request: {}", e);
                return Err(e);
            }
        };
        let msg_id = future.msg_id().to_string();

        if !sink.bind(generation) {
            error!(
                "[coordinator] {} (generation {}) lost the output sink to a newer execution",
                msg_id, generation
            );
            return Err(BridgeError::OutputSuperseded(msg_id));
        }
        self.context.set_current(CurrentExecution {
            generation,
            msg_id: msg_id.clone(),
        });
        info!(
            "[coordinator] Submitted {} (generation {}) on session {}",
            msg_id,
            generation,
            session.session_id()
        );

        let driver = Driver {
            generation,
            sink,
            hydrator: self.hydrator.clone(),
            tap: self.tap.clone(),
        };
        let task = tokio::spawn(driver.run(future));

        Ok(ExecutionHandle {
            generation,
            msg_id,
            task,
        })
    }

    /// Execute the mounted editor's current code.
    pub fn execute_current(&self) -> Result<ExecutionHandle> {
        let Some(code) = self.context.current_code() else {
            error!("[coordinator] Cannot execute: no editor mounted");
            return Err(BridgeError::EditorNotMounted);
        };
        self.execute(&code)
    }
}

/// Routes the output of one execute request.
struct Driver {
    generation: u64,
    sink: OutputSink,
    hydrator: Arc<WidgetHydrator>,
    tap: Option<Arc<dyn MessageTap>>,
}

impl Driver {
    async fn run(self, mut future: ExecutionFuture) -> ExecutionOutcome {
        let msg_id = future.msg_id().to_string();
        let mut routed = 0;
        let mut discarded = 0;

        while let Some(message) = future.next_output().await {
            if self.route(&message) {
                routed += 1;
            } else {
                discarded += 1;
            }
        }

        match future.done().await {
            Ok(status) => {
                if status == ReplyStatus::Ok {
                    info!("[coordinator] {} completed", msg_id);
                } else {
                    warn!("[coordinator] {} finished with status {:?}", msg_id, status);
                }
                ExecutionOutcome::Completed {
                    status,
                    routed,
                    discarded,
                }
            }
            Err(e) => {
                error!("[coordinator] {} failed: {}", msg_id, e);
                ExecutionOutcome::Failed {
                    error: e,
                    routed,
                    discarded,
                }
            }
        }
    }

    /// Returns false when the message was discarded as stale.
    fn route(&self, message: &JupyterMessage) -> bool {
        if let Some(tap) = &self.tap {
            tap.observe("in", "iopub", message);
        }

        if self.sink.apply_for(self.generation, message).is_none() {
            debug!(
                "[coordinator] Discarding {} from superseded generation {}",
                message.header.msg_type, self.generation
            );
            return false;
        }

        self.hydrator.hydrate_message(message);
        true
    }
}
