//! The kernel-facing seam the bridge is written against.
//!
//! A [`KernelSession`] is an opaque handle to a live kernel connection. It
//! hands out one [`ExecutionFuture`] per submitted request and announces
//! kernel-opened comms to whoever registered for their target name. The
//! ZeroMQ implementation lives in [`crate::jupyter`]; tests use in-memory
//! fakes.

use std::sync::Arc;

use bytes::Bytes;
use jupyter_protocol::{JupyterMessage, ReplyStatus};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{BridgeError, Result};

/// Callback invoked with a message arriving on a native comm.
pub type MessageHandler = Box<dyn Fn(&JupyterMessage) + Send + Sync>;

/// Callback invoked when the kernel opens a comm for a registered target.
/// Receives the new comm and the originating comm_open message.
pub type CommOpenHandler = Box<dyn Fn(Arc<dyn Comm>, &JupyterMessage) + Send + Sync>;

/// A kernel-side comm as exposed by the session.
///
/// Handler slots are single-subscriber: registering replaces the previous
/// handler.
pub trait Comm: Send + Sync {
    fn comm_id(&self) -> &str;

    fn target_name(&self) -> &str;

    /// Queue a comm_msg for the kernel.
    fn send(&self, data: Value, metadata: Value, buffers: Vec<Bytes>) -> Result<()>;

    /// Queue a comm_close for the kernel and mark the comm closed.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn on_msg(&self, handler: MessageHandler);

    fn on_close(&self, handler: MessageHandler);
}

/// A live connection to a kernel.
pub trait KernelSession: Send + Sync {
    fn session_id(&self) -> &str;

    /// Submit code for execution. Returns as soon as the request is queued.
    fn execute(&self, code: &str) -> Result<ExecutionFuture>;

    /// Route kernel-opened comms with `target_name` to `handler`.
    ///
    /// A later registration for the same target replaces the earlier one.
    fn register_comm_target(&self, target_name: &str, handler: CommOpenHandler);

    /// Best-effort teardown. Outstanding futures are abandoned.
    fn shutdown(&self);
}

/// Completion signal of one execute request.
pub type ReplySender = oneshot::Sender<Result<ReplyStatus>>;

/// One outstanding execute request.
///
/// Output messages arrive in kernel emission order on an unbounded stream
/// that ends once the kernel reports the request idle (or the connection
/// goes away). Completion is signalled separately by the execute_reply.
#[derive(Debug)]
pub struct ExecutionFuture {
    msg_id: String,
    outputs: mpsc::UnboundedReceiver<JupyterMessage>,
    reply: oneshot::Receiver<Result<ReplyStatus>>,
}

impl ExecutionFuture {
    /// Create a future plus the sending halves a session implementation
    /// feeds.
    pub fn channel(
        msg_id: impl Into<String>,
    ) -> (
        ExecutionFuture,
        mpsc::UnboundedSender<JupyterMessage>,
        ReplySender,
    ) {
        let (outputs_tx, outputs) = mpsc::unbounded_channel();
        let (reply_tx, reply) = oneshot::channel();
        let future = ExecutionFuture {
            msg_id: msg_id.into(),
            outputs,
            reply,
        };
        (future, outputs_tx, reply_tx)
    }

    /// The execute_request msg_id; output messages carry it as parent.
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// Next output message, or `None` once the stream has ended.
    pub async fn next_output(&mut self) -> Option<JupyterMessage> {
        self.outputs.recv().await
    }

    /// Wait for the execute_reply.
    ///
    /// A dropped sender means the connection went away before replying.
    pub async fn done(self) -> Result<ReplyStatus> {
        match self.reply.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::ConnectionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::build_message;
    use serde_json::json;

    #[tokio::test]
    async fn test_future_yields_outputs_in_order_then_reply() {
        let (mut future, outputs, reply) = ExecutionFuture::channel("req-1");
        assert_eq!(future.msg_id(), "req-1");

        for text in ["a", "b", "c"] {
            let msg =
                build_message("stream", json!({"name": "stdout", "text": text})).unwrap();
            outputs.send(msg).unwrap();
        }
        drop(outputs);
        reply.send(Ok(ReplyStatus::Ok)).unwrap();

        let mut seen = Vec::new();
        while let Some(msg) = future.next_output().await {
            seen.push(msg.header.msg_type.clone());
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(future.done().await.unwrap(), ReplyStatus::Ok);
    }

    #[tokio::test]
    async fn test_dropped_reply_is_connection_closed() {
        let (future, outputs, reply) = ExecutionFuture::channel("req-2");
        drop(outputs);
        drop(reply);
        assert!(matches!(
            future.done().await,
            Err(BridgeError::ConnectionClosed)
        ));
    }
}
