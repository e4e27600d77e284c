//! Channel adapter: native kernel comms in the classic widget comm shape.
//!
//! Widget runtimes built for the classic notebook talk to comms through a
//! small fixed surface (`on_msg`, `on_close`, `send`, `close`, `open`) and
//! expect messages as classic JSON envelopes. [`CommAdapter`] wraps one
//! native [`Comm`] and translates in both directions.

use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use serde_json::Value;

use crate::error::Result;
use crate::session::Comm;
use crate::wire::CommWireMessage;

/// Callback receiving a comm message in the classic shape.
pub type ClassicCallback = Box<dyn Fn(&CommWireMessage) + Send + Sync>;

/// The comm surface a classic widget runtime programs against.
pub trait ClassicCommView: Send + Sync {
    fn comm_id(&self) -> &str;

    fn target_name(&self) -> &str;

    /// Register the message callback. Replaces any previous one.
    fn on_msg(&self, callback: ClassicCallback);

    /// Register the close callback. Replaces any previous one.
    fn on_close(&self, callback: ClassicCallback);

    /// Send data to the kernel side of the comm. `callbacks` exists for
    /// call-shape compatibility and is not used by the transport.
    fn send(
        &self,
        data: Value,
        callbacks: Option<ClassicCallback>,
        metadata: Value,
        buffers: Vec<Bytes>,
    ) -> Result<String>;

    fn close(&self) -> Result<String>;

    /// The comm is already open on the kernel side; nothing to do.
    fn open(&self) -> String;

    fn is_closed(&self) -> bool;
}

/// [`ClassicCommView`] over a native [`Comm`].
pub struct CommAdapter {
    comm: Arc<dyn Comm>,
}

impl CommAdapter {
    pub fn new(comm: Arc<dyn Comm>) -> Self {
        Self { comm }
    }

    fn wrap(callback: ClassicCallback) -> crate::session::MessageHandler {
        Box::new(move |message| match CommWireMessage::from_message(message) {
            Some(wire) => callback(&wire),
            None => debug!(
                "[comm] Dropping non-comm message on comm channel: {}",
                message.header.msg_type
            ),
        })
    }
}

impl ClassicCommView for CommAdapter {
    fn comm_id(&self) -> &str {
        self.comm.comm_id()
    }

    fn target_name(&self) -> &str {
        self.comm.target_name()
    }

    fn on_msg(&self, callback: ClassicCallback) {
        self.comm.on_msg(Self::wrap(callback));
    }

    fn on_close(&self, callback: ClassicCallback) {
        self.comm.on_close(Self::wrap(callback));
    }

    fn send(
        &self,
        data: Value,
        _callbacks: Option<ClassicCallback>,
        metadata: Value,
        buffers: Vec<Bytes>,
    ) -> Result<String> {
        self.comm.send(data, metadata, buffers)?;
        Ok(self.comm.comm_id().to_string())
    }

    fn close(&self) -> Result<String> {
        self.comm.close()?;
        Ok(self.comm.comm_id().to_string())
    }

    fn open(&self) -> String {
        debug!(
            "[comm] open() on already-open comm {} (target {})",
            self.comm.comm_id(),
            self.comm.target_name()
        );
        self.comm.comm_id().to_string()
    }

    fn is_closed(&self) -> bool {
        self.comm.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::session::MessageHandler;
    use crate::wire::build_message;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeComm {
        sent: Mutex<Vec<(Value, Value, usize)>>,
        on_msg: Mutex<Option<MessageHandler>>,
        on_close: Mutex<Option<MessageHandler>>,
        closed: AtomicBool,
    }

    impl FakeComm {
        fn push(&self, message: &jupyter_protocol::JupyterMessage) {
            if let Some(handler) = self.on_msg.lock().unwrap().as_ref() {
                handler(message);
            }
        }
    }

    impl Comm for FakeComm {
        fn comm_id(&self) -> &str {
            "X"
        }
        fn target_name(&self) -> &str {
            "T"
        }
        fn send(&self, data: Value, metadata: Value, buffers: Vec<Bytes>) -> Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BridgeError::CommClosed("X".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((data, metadata, buffers.len()));
            Ok(())
        }
        fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
        fn on_msg(&self, handler: MessageHandler) {
            *self.on_msg.lock().unwrap() = Some(handler);
        }
        fn on_close(&self, handler: MessageHandler) {
            *self.on_close.lock().unwrap() = Some(handler);
        }
    }

    #[test]
    fn test_send_and_close_report_comm_id() {
        let native = Arc::new(FakeComm::default());
        let view = CommAdapter::new(native.clone());

        assert_eq!(view.comm_id(), "X");
        assert_eq!(view.target_name(), "T");

        let id = view
            .send(json!({"method": "update"}), None, json!({"k": 1}), vec![Bytes::from("b")])
            .unwrap();
        assert_eq!(id, "X");
        let sent = native.sent.lock().unwrap();
        assert_eq!(sent[0], (json!({"method": "update"}), json!({"k": 1}), 1));
        drop(sent);

        assert_eq!(view.close().unwrap(), "X");
        assert!(view.is_closed());
    }

    #[test]
    fn test_send_after_close_propagates_transport_error() {
        let native = Arc::new(FakeComm::default());
        let view = CommAdapter::new(native);
        view.close().unwrap();
        let err = view.send(json!({}), None, json!({}), vec![]).unwrap_err();
        assert!(matches!(err, BridgeError::CommClosed(_)));
    }

    #[test]
    fn test_open_is_noop_returning_id() {
        let native = Arc::new(FakeComm::default());
        let view = CommAdapter::new(native.clone());
        assert_eq!(view.open(), "X");
        assert!(native.sent.lock().unwrap().is_empty());
        assert!(!view.is_closed());
    }

    #[test]
    fn test_pushed_message_reaches_on_msg_callback() {
        let native = Arc::new(FakeComm::default());
        let view = CommAdapter::new(native.clone());

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        view.on_msg(Box::new(move |msg| {
            sink.lock().unwrap().push(msg.content.data.clone());
        }));

        let message = build_message(
            "comm_msg",
            json!({"comm_id": "X", "data": {"method": "update", "state": {"value": 7}}}),
        )
        .unwrap();
        native.push(&message);

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["state"]["value"], 7);
    }

    #[test]
    fn test_on_msg_is_single_slot() {
        let native = Arc::new(FakeComm::default());
        let view = CommAdapter::new(native.clone());

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = first.clone();
        view.on_msg(Box::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        let s = second.clone();
        view.on_msg(Box::new(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        let message =
            build_message("comm_msg", json!({"comm_id": "X", "data": {}})).unwrap();
        native.push(&message);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
