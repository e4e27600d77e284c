//! Comm registrar: announces kernel-opened widget comms to the runtime.
//!
//! The registrar subscribes to comm_open events for the widget target on
//! the active session, wraps each new comm in a [`CommAdapter`] and hands it
//! to the widget runtime. Each comm id gets exactly one adapter; a repeated
//! open for the same id reuses it and is not re-announced.
//!
//! Registration is per session. When the session changes the registrar is
//! registered again on the new one and forgets the old views. Every
//! registration carries an epoch; opens delivered through an older
//! registration are ignored, since the old session may still hold its
//! handler until it is torn down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use jupyter_protocol::JupyterMessage;
use log::{debug, error, info, warn};

use crate::comm::{ClassicCommView, CommAdapter};
use crate::session::{Comm, KernelSession};
use crate::widgets::WidgetRuntime;

#[derive(Default)]
struct Registry {
    /// Bumped by every `register`.
    epoch: u64,
    views: HashMap<String, Arc<CommAdapter>>,
}

type Shared = Arc<Mutex<Registry>>;

pub struct CommRegistrar {
    target_name: String,
    runtime: Arc<dyn WidgetRuntime>,
    registry: Shared,
}

impl CommRegistrar {
    pub fn new(target_name: impl Into<String>, runtime: Arc<dyn WidgetRuntime>) -> Self {
        Self {
            target_name: target_name.into(),
            runtime,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Subscribe to comm opens for the widget target on `session`.
    pub fn register(&self, session: &dyn KernelSession) {
        let epoch = {
            let mut registry = self.registry();
            registry.views.clear();
            registry.epoch += 1;
            registry.epoch
        };

        let registry = self.registry.clone();
        let runtime = self.runtime.clone();
        session.register_comm_target(
            &self.target_name,
            Box::new(move |comm, open_msg| {
                Self::on_comm_open(&registry, epoch, runtime.as_ref(), comm, open_msg);
            }),
        );
        info!(
            "[registrar] Registered comm target {} on session {}",
            self.target_name,
            session.session_id()
        );
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_comm_open(
        registry: &Shared,
        epoch: u64,
        runtime: &dyn WidgetRuntime,
        comm: Arc<dyn Comm>,
        open_msg: &JupyterMessage,
    ) {
        let comm_id = comm.comm_id().to_string();
        let view = {
            let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if registry.epoch != epoch {
                debug!(
                    "[registrar] Ignoring comm_open for {} from a replaced session",
                    comm_id
                );
                return;
            }
            let views = &mut registry.views;
            if views.contains_key(&comm_id) {
                warn!(
                    "[registrar] Duplicate comm_open for {}, keeping existing view",
                    comm_id
                );
                return;
            }
            views.retain(|_, view| !view.is_closed());
            let view = Arc::new(CommAdapter::new(comm));
            views.insert(comm_id.clone(), view.clone());
            view
        };

        debug!("[registrar] comm_open: comm_id={}", comm_id);
        if let Err(e) = runtime.handle_comm_open(view, open_msg) {
            error!(
                "[registrar] Widget runtime failed to open comm {}: {}",
                comm_id, e
            );
        }
    }

    /// The view for an open comm.
    pub fn view(&self, comm_id: &str) -> Option<Arc<dyn ClassicCommView>> {
        self.registry()
            .views
            .get(comm_id)
            .map(|view| view.clone() as Arc<dyn ClassicCommView>)
    }

    /// Number of views created on the current session.
    pub fn len(&self) -> usize {
        self.registry().views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
