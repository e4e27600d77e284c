//! Session-scoped state shared by the bridge components.
//!
//! One [`SessionContext`] per application instance owns the active kernel
//! session, the output sink, the current execution and the mounted editor's
//! code accessor. Components receive the context explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::info;

use crate::output::OutputSink;
use crate::registrar::CommRegistrar;
use crate::session::KernelSession;

/// Supplies the editor's current code text on demand.
pub type CodeAccessor = Box<dyn Fn() -> String + Send + Sync>;

/// The execution the UI currently considers current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentExecution {
    pub generation: u64,
    pub msg_id: String,
}

pub struct SessionContext {
    registrar: CommRegistrar,
    session: Mutex<Option<Arc<dyn KernelSession>>>,
    output: Mutex<Option<OutputSink>>,
    current: Mutex<Option<CurrentExecution>>,
    editor: Mutex<Option<CodeAccessor>>,
    next_generation: AtomicU64,
}

impl SessionContext {
    pub fn new(registrar: CommRegistrar) -> Self {
        Self {
            registrar,
            session: Mutex::new(None),
            output: Mutex::new(None),
            current: Mutex::new(None),
            editor: Mutex::new(None),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn registrar(&self) -> &CommRegistrar {
        &self.registrar
    }

    /// Make `session` the active session, tearing down the previous one.
    ///
    /// The comm registrar is registered on the new session. Outstanding
    /// executions of the old session are abandoned.
    pub fn connect(&self, session: Arc<dyn KernelSession>) {
        self.registrar.register(session.as_ref());
        info!("[context] Session {} active", session.session_id());

        let previous = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(session);
        self.forget_current();
        if let Some(previous) = previous {
            info!("[context] Tearing down session {}", previous.session_id());
            previous.shutdown();
        }
    }

    /// Tear down the active session, if any.
    pub fn disconnect(&self) {
        let previous = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.forget_current();
        if let Some(previous) = previous {
            info!("[context] Tearing down session {}", previous.session_id());
            previous.shutdown();
        }
    }

    pub fn session(&self) -> Option<Arc<dyn KernelSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_output(&self, sink: OutputSink) {
        *self.output.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn output(&self) -> Option<OutputSink> {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Editor-mount callback: remember how to fetch the current code.
    pub fn mount_editor(&self, accessor: CodeAccessor) {
        *self.editor.lock().unwrap_or_else(PoisonError::into_inner) = Some(accessor);
    }

    pub fn unmount_editor(&self) {
        *self.editor.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The mounted editor's current text.
    pub fn current_code(&self) -> Option<String> {
        self.editor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|accessor| accessor())
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn set_current(&self, current: CurrentExecution) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(current);
    }

    pub fn current(&self) -> Option<CurrentExecution> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn forget_current(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sink) = self.output() {
            sink.unbind();
        }
    }
}
