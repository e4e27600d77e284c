//! Widget runtime seam and a headless widget model store.
//!
//! The bridge hands comms and full-state payloads to a [`WidgetRuntime`].
//! Browser frontends implement it with their own widget manager; the
//! [`WidgetModelStore`] here is the headless runtime used by the CLI and
//! tests. It keeps every widget model's state in sync with the kernel:
//!
//! - `comm_open` establishes a model with its initial state
//! - `comm_msg` with `method: "update"` merges a state delta
//! - `comm_close` drops the model
//! - a `application/vnd.jupyter.widget-state+json` payload materializes
//!   models wholesale (the form notebooks embed for offline rendering)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use jupyter_protocol::JupyterMessage;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::comm::ClassicCommView;
use crate::error::{BridgeError, Result};
use crate::wire::CommWireMessage;

/// The widget runtime entry points the bridge drives.
pub trait WidgetRuntime: Send + Sync {
    /// A kernel-opened comm for the widget target, with its comm_open message.
    fn handle_comm_open(&self, comm: Arc<dyn ClassicCommView>, open_msg: &JupyterMessage)
        -> Result<()>;

    /// Apply a full widget-state mapping (model id -> model).
    ///
    /// Must be idempotent: applying the same payload twice leaves the same
    /// state as applying it once.
    fn set_state(&self, state: &Value) -> Result<()>;
}

/// A snapshot of one widget model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetSnapshot {
    /// The model id (the comm_id for comm-backed models).
    pub model_id: String,

    /// Current state (merged from all updates).
    pub state: Value,

    /// Model module (e.g., "@jupyter-widgets/controls", "anywidget").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_module: Option<String>,

    /// Model name (e.g., "IntSliderModel", "AnyModel").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,

    /// Binary buffers received with the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Vec<u8>>,

    /// Whether a live comm backs this model.
    pub live: bool,
}

struct ModelEntry {
    snapshot: WidgetSnapshot,
    seq: u64,
    view: Option<Arc<dyn ClassicCommView>>,
}

struct Models {
    entries: RwLock<HashMap<String, ModelEntry>>,
    next_seq: AtomicU64,
}

impl Models {
    /// Insert or replace a model. `buffers: None` keeps whatever buffers the
    /// model already has.
    fn upsert(
        &self,
        model_id: &str,
        state: Value,
        buffers: Option<Vec<Vec<u8>>>,
        view: Option<Arc<dyn ClassicCommView>>,
    ) {
        let model_module = string_field(&state, "_model_module");
        let model_name = string_field(&state, "_model_name");

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(model_id) {
            Some(entry) => {
                entry.snapshot.state = state;
                entry.snapshot.model_module = model_module;
                entry.snapshot.model_name = model_name;
                if let Some(buffers) = buffers {
                    entry.snapshot.buffers = buffers;
                }
                if view.is_some() {
                    entry.view = view;
                }
                entry.snapshot.live = entry.view.is_some();
            }
            None => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let live = view.is_some();
                entries.insert(
                    model_id.to_string(),
                    ModelEntry {
                        snapshot: WidgetSnapshot {
                            model_id: model_id.to_string(),
                            state,
                            model_module,
                            model_name,
                            buffers: buffers.unwrap_or_default(),
                            live,
                        },
                        seq,
                        view,
                    },
                );
            }
        }
    }

    fn merge_update(&self, model_id: &str, delta: &Value) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(model_id) {
            if let (Some(existing), Some(delta)) =
                (entry.snapshot.state.as_object_mut(), delta.as_object())
            {
                for (key, value) in delta {
                    existing.insert(key.clone(), value.clone());
                }
            }
        }
        // Updates for unknown models are ignored (may be out-of-order)
    }

    fn remove(&self, model_id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(model_id);
    }
}

fn string_field(state: &Value, key: &str) -> Option<String> {
    state.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// Headless [`WidgetRuntime`] that tracks widget models in insertion order.
///
/// Insertion order matters for replay: widgets reference other widgets
/// (layouts, styles) and those must exist first.
pub struct WidgetModelStore {
    models: Arc<Models>,
}

impl WidgetModelStore {
    pub fn new() -> Self {
        Self {
            models: Arc::new(Models {
                entries: RwLock::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// All models in insertion order.
    pub fn snapshots(&self) -> Vec<WidgetSnapshot> {
        let entries = self
            .models
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut sorted: Vec<_> = entries.values().collect();
        sorted.sort_by_key(|e| e.seq);
        sorted.into_iter().map(|e| e.snapshot.clone()).collect()
    }

    pub fn get(&self, model_id: &str) -> Option<WidgetSnapshot> {
        let entries = self
            .models
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        entries.get(model_id).map(|e| e.snapshot.clone())
    }

    pub fn len(&self) -> usize {
        self.models
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every model. Called when the kernel goes away.
    pub fn clear(&self) {
        self.models
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.models.next_seq.store(0, Ordering::Relaxed);
    }

    /// Change one state key from the frontend side and sync it to the kernel.
    pub fn set_value(&self, model_id: &str, key: &str, value: Value) -> Result<()> {
        let view = {
            let entries = self
                .models
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            entries.get(model_id).and_then(|e| e.view.clone())
        }
        .ok_or_else(|| BridgeError::CommClosed(model_id.to_string()))?;

        let delta = json!({ key: value });
        view.send(
            json!({"method": "update", "state": delta, "buffer_paths": []}),
            None,
            json!({}),
            Vec::new(),
        )?;
        self.models.merge_update(model_id, &delta);
        Ok(())
    }
}

impl Default for WidgetModelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WidgetRuntime for WidgetModelStore {
    fn handle_comm_open(
        &self,
        comm: Arc<dyn ClassicCommView>,
        open_msg: &JupyterMessage,
    ) -> Result<()> {
        let wire = CommWireMessage::from_message(open_msg).ok_or_else(|| BridgeError::Protocol {
            msg_type: open_msg.header.msg_type.clone(),
            reason: "expected comm_open".to_string(),
        })?;

        // ipywidgets puts the model state in data.state
        let state = wire
            .content
            .data
            .get("state")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let buffers = wire.buffers.iter().map(|b| b.to_vec()).collect();
        let model_id = comm.comm_id().to_string();

        debug!("[widgets] Model opened: {}", model_id);
        self.models
            .upsert(&model_id, state, Some(buffers), Some(comm.clone()));

        let models: Weak<Models> = Arc::downgrade(&self.models);
        let id = model_id.clone();
        comm.on_msg(Box::new(move |msg| {
            let Some(models) = models.upgrade() else {
                return;
            };
            match msg.method() {
                Some("update") => {
                    if let Some(delta) = msg.content.data.get("state") {
                        models.merge_update(&id, delta);
                    }
                }
                other => debug!("[widgets] Ignoring comm_msg method {:?} for {}", other, id),
            }
        }));

        let models: Weak<Models> = Arc::downgrade(&self.models);
        let id = model_id;
        comm.on_close(Box::new(move |_| {
            if let Some(models) = models.upgrade() {
                debug!("[widgets] Model closed: {}", id);
                models.remove(&id);
            }
        }));

        Ok(())
    }

    fn set_state(&self, state: &Value) -> Result<()> {
        // Accept both the full document form {version_major, state: {...}}
        // and a bare model-id mapping.
        let mapping = match state.get("state") {
            Some(inner) if state.get("version_major").is_some() => inner,
            _ => state,
        };
        let models = mapping.as_object().ok_or_else(|| {
            BridgeError::WidgetRuntime("widget state must be an object of models".to_string())
        })?;

        for (model_id, model) in models {
            let Some(model_obj) = model.as_object() else {
                warn!("[widgets] Skipping non-object model {}", model_id);
                continue;
            };
            let mut model_state = match model_obj.get("state") {
                Some(Value::Object(inner)) => inner.clone(),
                _ => model_obj.clone(),
            };
            // Widget-state documents carry the model identity beside the state
            for (field, key) in [
                ("model_name", "_model_name"),
                ("model_module", "_model_module"),
                ("model_module_version", "_model_module_version"),
            ] {
                if let Some(v) = model_obj.get(field) {
                    model_state.entry(key.to_string()).or_insert_with(|| v.clone());
                }
            }
            self.models
                .upsert(model_id, Value::Object(model_state), None, None);
        }
        Ok(())
    }
}
