//! Widget hydration from display_data bundles.
//!
//! Kernels that render widgets for static viewing embed the full widget
//! state in a display_data bundle under the widget-state MIME key. The
//! hydrator pulls that payload out and pushes it into the widget runtime's
//! full-state entry point so the matching comms become live widgets.

use std::sync::Arc;

use jupyter_protocol::{JupyterMessage, JupyterMessageContent};
use log::{debug, error};
use serde_json::Value;

use crate::error::{BridgeError, Result};
use crate::widgets::WidgetRuntime;

pub struct WidgetHydrator {
    runtime: Arc<dyn WidgetRuntime>,
    state_mime: String,
}

impl WidgetHydrator {
    pub fn new(runtime: Arc<dyn WidgetRuntime>, state_mime: impl Into<String>) -> Self {
        Self {
            runtime,
            state_mime: state_mime.into(),
        }
    }

    /// The widget-state payload of a display_data message, if it has one.
    ///
    /// Only display_data qualifies; execute_result and update_display_data
    /// bundles are never hydrated.
    pub fn widget_state(&self, content: &JupyterMessageContent) -> Option<Value> {
        let JupyterMessageContent::DisplayData(display) = content else {
            return None;
        };
        let mut bundle = serde_json::to_value(&display.data).ok()?;
        bundle
            .as_object_mut()
            .and_then(|data| data.remove(&self.state_mime))
    }

    /// Push a widget-state payload into the runtime.
    pub fn hydrate(&self, state: &Value) -> Result<()> {
        if !state.is_object() {
            return Err(BridgeError::MalformedWidgetState(format!(
                "expected an object keyed by model id, got {}",
                json_kind(state)
            )));
        }
        self.runtime.set_state(state)
    }

    /// Hydrate from a message if it carries widget state.
    ///
    /// Returns whether hydration was attempted. Failures are logged and
    /// swallowed so the rest of the output stream keeps flowing.
    pub fn hydrate_message(&self, message: &JupyterMessage) -> bool {
        let Some(state) = self.widget_state(&message.content) else {
            return false;
        };
        debug!(
            "[hydrator] Hydrating widget state from {}",
            message.header.msg_id
        );
        if let Err(e) = self.hydrate(&state) {
            error!("[hydrator] Failed to hydrate widget state: {}", e);
        }
        true
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
