//! Output sink: the ordered, renderable output of the current execution.
//!
//! The sink owns lifecycle, not interpretation. It keeps one ordered list of
//! [`OutputRecord`]s, remembers which execution generation it is bound to,
//! and tells an [`OutputSurface`] what changed. Drawing MIME bundles is the
//! surface's business.
//!
//! Kernel output semantics applied here:
//! - consecutive stream messages of the same name merge into one record
//! - `clear_output` empties the model, or with `wait: true` defers the clear
//!   until the next record arrives
//! - `update_display_data` rewrites every record sharing its `display_id`

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use jupyter_protocol::{JupyterMessage, JupyterMessageContent};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One renderable output, in nbformat shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum OutputRecord {
    Stream {
        name: String,
        text: String,
    },
    DisplayData {
        data: Map<String, Value>,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_id: Option<String>,
    },
    ExecuteResult {
        data: Map<String, Value>,
        #[serde(default)]
        metadata: Map<String, Value>,
        execution_count: usize,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

fn to_object<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

impl OutputRecord {
    /// Convert kernel output content into a record. Non-output messages
    /// (status, execute_input, comms, clear_output, ...) yield `None`.
    pub fn from_content(content: &JupyterMessageContent) -> Option<Self> {
        match content {
            JupyterMessageContent::StreamContent(stream) => {
                let name = match stream.name {
                    jupyter_protocol::Stdio::Stdout => "stdout",
                    jupyter_protocol::Stdio::Stderr => "stderr",
                };
                Some(OutputRecord::Stream {
                    name: name.to_string(),
                    text: stream.text.clone(),
                })
            }
            JupyterMessageContent::DisplayData(display) => Some(OutputRecord::DisplayData {
                data: to_object(&display.data),
                metadata: to_object(&display.metadata),
                display_id: display
                    .transient
                    .as_ref()
                    .and_then(|t| t.display_id.clone()),
            }),
            JupyterMessageContent::ExecuteResult(result) => Some(OutputRecord::ExecuteResult {
                data: to_object(&result.data),
                metadata: to_object(&result.metadata),
                execution_count: result.execution_count.0 as usize,
            }),
            JupyterMessageContent::ErrorOutput(error) => Some(OutputRecord::Error {
                ename: error.ename.clone(),
                evalue: error.evalue.clone(),
                traceback: error.traceback.clone(),
            }),
            _ => None,
        }
    }

    pub fn output_type(&self) -> &'static str {
        match self {
            OutputRecord::Stream { .. } => "stream",
            OutputRecord::DisplayData { .. } => "display_data",
            OutputRecord::ExecuteResult { .. } => "execute_result",
            OutputRecord::Error { .. } => "error",
        }
    }

    /// The `text/plain` representation, when the record has one.
    pub fn plain_text(&self) -> Option<&str> {
        match self {
            OutputRecord::Stream { text, .. } => Some(text),
            OutputRecord::DisplayData { data, .. } | OutputRecord::ExecuteResult { data, .. } => {
                data.get("text/plain").and_then(|v| v.as_str())
            }
            OutputRecord::Error { evalue, .. } => Some(evalue),
        }
    }
}

/// Where rendering happens. Implemented by the UI layer.
pub trait OutputSurface: Send + Sync {
    /// The model was emptied.
    fn cleared(&self);

    /// A record was appended at `index`.
    fn appended(&self, index: usize, record: &OutputRecord);

    /// The record at `index` changed in place.
    fn replaced(&self, index: usize, record: &OutputRecord);
}

/// Surface that draws nothing.
pub struct NullSurface;

impl OutputSurface for NullSurface {
    fn cleared(&self) {}
    fn appended(&self, _index: usize, _record: &OutputRecord) {}
    fn replaced(&self, _index: usize, _record: &OutputRecord) {}
}

#[derive(Default)]
struct OutputModel {
    records: Vec<OutputRecord>,
    /// Execution generation this sink currently renders.
    binding: Option<u64>,
    /// Set by clear(); a bind is only allowed after a clear.
    cleared_since_bind: bool,
    /// clear_output(wait=True) is pending until the next record.
    clear_pending: bool,
}

impl OutputModel {
    /// Empty the records but keep the binding (kernel-requested clear).
    fn clear_records(&mut self, surface: &dyn OutputSurface) {
        self.records.clear();
        self.clear_pending = false;
        surface.cleared();
    }

    fn apply(&mut self, message: &JupyterMessage, surface: &dyn OutputSurface) -> Option<usize> {
        match &message.content {
            JupyterMessageContent::ClearOutput(clear) => {
                if clear.wait {
                    self.clear_pending = true;
                } else {
                    self.clear_records(surface);
                }
                None
            }
            JupyterMessageContent::UpdateDisplayData(update) => {
                let display_id = update.transient.display_id.as_deref()?;
                self.update_display(
                    display_id,
                    to_object(&update.data),
                    to_object(&update.metadata),
                    surface,
                )
            }
            content => {
                let record = OutputRecord::from_content(content)?;
                Some(self.push(record, surface))
            }
        }
    }

    fn push(&mut self, record: OutputRecord, surface: &dyn OutputSurface) -> usize {
        if self.clear_pending {
            self.clear_records(surface);
        }

        if let (
            OutputRecord::Stream { name, text },
            Some(OutputRecord::Stream {
                name: last_name,
                text: last_text,
            }),
        ) = (&record, self.records.last_mut())
        {
            if name == last_name {
                last_text.push_str(text);
                let index = self.records.len() - 1;
                surface.replaced(index, &self.records[index]);
                return index;
            }
        }

        self.records.push(record);
        let index = self.records.len() - 1;
        surface.appended(index, &self.records[index]);
        index
    }

    fn update_display(
        &mut self,
        display_id: &str,
        data: Map<String, Value>,
        metadata: Map<String, Value>,
        surface: &dyn OutputSurface,
    ) -> Option<usize> {
        let mut last = None;
        for (index, record) in self.records.iter_mut().enumerate() {
            if let OutputRecord::DisplayData {
                data: d,
                metadata: m,
                display_id: Some(id),
            } = record
            {
                if id == display_id {
                    *d = data.clone();
                    *m = metadata.clone();
                    surface.replaced(index, record);
                    last = Some(index);
                }
            }
        }
        if last.is_none() {
            debug!("[output] No output found for display_id={}", display_id);
        }
        last
    }
}

/// The output area for one execution at a time. Cheap to clone.
///
/// Surface callbacks run while the sink is locked so the surface sees
/// changes in model order. They must not call back into the sink.
#[derive(Clone)]
pub struct OutputSink {
    model: Arc<Mutex<OutputModel>>,
    surface: Arc<dyn OutputSurface>,
}

impl OutputSink {
    pub fn new(surface: Arc<dyn OutputSurface>) -> Self {
        Self {
            model: Arc::new(Mutex::new(OutputModel {
                cleared_since_bind: true,
                ..Default::default()
            })),
            surface,
        }
    }

    fn model(&self) -> MutexGuard<'_, OutputModel> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Empty the model and drop the current binding.
    pub fn clear(&self) {
        let mut model = self.model();
        model.binding = None;
        model.cleared_since_bind = true;
        model.clear_records(self.surface.as_ref());
    }

    /// Bind to an execution generation. Refused unless the sink was cleared
    /// since its previous binding.
    pub fn bind(&self, generation: u64) -> bool {
        let mut model = self.model();
        if !model.cleared_since_bind {
            warn!(
                "[output] Refusing to bind generation {} without clearing (bound to {:?})",
                generation, model.binding
            );
            return false;
        }
        model.binding = Some(generation);
        model.cleared_since_bind = false;
        true
    }

    /// Stop rendering the bound execution without touching the records.
    pub fn unbind(&self) {
        self.model().binding = None;
    }

    pub fn binding(&self) -> Option<u64> {
        self.model().binding
    }

    pub fn is_bound_to(&self, generation: u64) -> bool {
        self.model().binding == Some(generation)
    }

    /// Apply one kernel message regardless of binding. Returns the index of
    /// the record that was appended or changed, if any.
    pub fn apply(&self, message: &JupyterMessage) -> Option<usize> {
        self.model().apply(message, self.surface.as_ref())
    }

    /// Apply `message` only if the sink is still bound to `generation`.
    ///
    /// `None` means the message was refused; `Some(index)` carries what
    /// [`apply`](Self::apply) would return. The binding check and the change
    /// happen under one lock, so a concurrent clear cannot slip between them.
    pub fn apply_for(&self, generation: u64, message: &JupyterMessage) -> Option<Option<usize>> {
        let mut model = self.model();
        if model.binding != Some(generation) {
            return None;
        }
        Some(model.apply(message, self.surface.as_ref()))
    }

    /// Append a record, merging consecutive same-name stream text.
    pub fn push(&self, record: OutputRecord) -> usize {
        self.model().push(record, self.surface.as_ref())
    }

    pub fn records(&self) -> Vec<OutputRecord> {
        self.model().records.clone()
    }

    pub fn len(&self) -> usize {
        self.model().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.model().records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::build_message;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSurface {
        events: Mutex<Vec<String>>,
    }

    impl OutputSurface for RecordingSurface {
        fn cleared(&self) {
            self.events.lock().unwrap().push("clear".into());
        }
        fn appended(&self, index: usize, record: &OutputRecord) {
            self.events
                .lock()
                .unwrap()
                .push(format!("append {} {}", index, record.output_type()));
        }
        fn replaced(&self, index: usize, record: &OutputRecord) {
            self.events
                .lock()
                .unwrap()
                .push(format!("replace {} {}", index, record.output_type()));
        }
    }

    fn stream(name: &str, text: &str) -> JupyterMessage {
        build_message("stream", json!({"name": name, "text": text})).unwrap()
    }

    fn display(text: &str, display_id: Option<&str>) -> JupyterMessage {
        let mut content = json!({"data": {"text/plain": text}, "metadata": {}});
        if let Some(id) = display_id {
            content["transient"] = json!({"display_id": id});
        }
        build_message("display_data", content).unwrap()
    }

    #[test]
    fn test_execute_result_becomes_record() {
        let sink = OutputSink::new(Arc::new(NullSurface));
        let message = build_message(
            "execute_result",
            json!({"data": {"text/plain": "2"}, "metadata": {}, "execution_count": 1}),
        )
        .unwrap();

        assert_eq!(sink.apply(&message), Some(0));
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].plain_text(), Some("2"));
        assert!(matches!(
            records[0],
            OutputRecord::ExecuteResult {
                execution_count: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_error_becomes_record() {
        let sink = OutputSink::new(Arc::new(NullSurface));
        let message = build_message(
            "error",
            json!({"ename": "ZeroDivisionError", "evalue": "division by zero", "traceback": ["tb"]}),
        )
        .unwrap();
        sink.apply(&message);
        let json = serde_json::to_value(&sink.records()[0]).unwrap();
        assert_eq!(json["output_type"], "error");
        assert_eq!(json["ename"], "ZeroDivisionError");
    }

    #[test]
    fn test_status_is_ignored() {
        let sink = OutputSink::new(Arc::new(NullSurface));
        let message = build_message("status", json!({"execution_state": "busy"})).unwrap();
        assert_eq!(sink.apply(&message), None);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_streams_merge_by_name() {
        let surface = Arc::new(RecordingSurface::default());
        let sink = OutputSink::new(surface.clone());

        sink.apply(&stream("stdout", "a"));
        sink.apply(&stream("stdout", "b"));
        sink.apply(&stream("stderr", "oops"));
        sink.apply(&stream("stdout", "c"));

        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].plain_text(), Some("ab"));
        assert_eq!(records[2].plain_text(), Some("c"));
        assert_eq!(
            *surface.events.lock().unwrap(),
            vec![
                "append 0 stream",
                "replace 0 stream",
                "append 1 stream",
                "append 2 stream"
            ]
        );
    }

    #[test]
    fn test_clear_output_immediate() {
        let sink = OutputSink::new(Arc::new(NullSurface));
        sink.apply(&stream("stdout", "a"));
        sink.apply(&build_message("clear_output", json!({"wait": false})).unwrap());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_clear_output_wait_defers_until_next_record() {
        let sink = OutputSink::new(Arc::new(NullSurface));
        sink.apply(&stream("stdout", "frame 1"));
        sink.apply(&build_message("clear_output", json!({"wait": true})).unwrap());
        assert_eq!(sink.len(), 1);

        sink.apply(&stream("stdout", "frame 2"));
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].plain_text(), Some("frame 2"));
    }

    #[test]
    fn test_update_display_data_replaces_in_place() {
        let sink = OutputSink::new(Arc::new(NullSurface));
        sink.apply(&display("0%", Some("progress")));
        sink.apply(&stream("stdout", "between"));
        sink.apply(&display("0%", Some("progress")));

        let update = build_message(
            "update_display_data",
            json!({
                "data": {"text/plain": "100%"},
                "metadata": {},
                "transient": {"display_id": "progress"}
            }),
        )
        .unwrap();
        assert_eq!(sink.apply(&update), Some(2));

        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].plain_text(), Some("100%"));
        assert_eq!(records[2].plain_text(), Some("100%"));
    }

    #[test]
    fn test_update_unknown_display_is_noop() {
        let sink = OutputSink::new(Arc::new(NullSurface));
        sink.apply(&display("x", None));
        let update = build_message(
            "update_display_data",
            json!({
                "data": {"text/plain": "y"},
                "metadata": {},
                "transient": {"display_id": "missing"}
            }),
        )
        .unwrap();
        assert_eq!(sink.apply(&update), None);
        assert_eq!(sink.records()[0].plain_text(), Some("x"));
    }

    #[test]
    fn test_bind_requires_clear() {
        let sink = OutputSink::new(Arc::new(NullSurface));
        assert!(sink.bind(1));
        assert!(sink.is_bound_to(1));

        assert!(!sink.bind(2));
        assert!(sink.is_bound_to(1));

        sink.clear();
        assert_eq!(sink.binding(), None);
        assert!(sink.bind(2));
        assert!(sink.is_bound_to(2));
    }

    #[test]
    fn test_clear_empties_model_and_notifies() {
        let surface = Arc::new(RecordingSurface::default());
        let sink = OutputSink::new(surface.clone());
        sink.apply(&stream("stdout", "a"));
        sink.clear();
        assert!(sink.is_empty());
        assert_eq!(surface.events.lock().unwrap().last().unwrap(), "clear");
    }

    #[test]
    fn test_apply_for_refuses_stale_generation() {
        let surface = Arc::new(RecordingSurface::default());
        let sink = OutputSink::new(surface.clone());
        assert!(sink.bind(1));
        assert_eq!(sink.apply_for(1, &stream("stdout", "first")), Some(Some(0)));

        sink.clear();
        assert!(sink.bind(2));
        surface.events.lock().unwrap().clear();

        assert_eq!(sink.apply_for(1, &stream("stdout", "late")), None);
        assert!(sink.is_empty());
        assert!(surface.events.lock().unwrap().is_empty());

        assert_eq!(sink.apply_for(2, &stream("stdout", "second")), Some(Some(0)));
        assert_eq!(sink.records()[0].plain_text(), Some("second"));
    }

    #[test]
    fn test_apply_for_after_clear_is_refused() {
        let sink = OutputSink::new(Arc::new(NullSurface));
        assert!(sink.bind(7));
        sink.clear();
        assert_eq!(sink.apply_for(7, &stream("stdout", "x")), None);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_apply_for_non_output_is_accepted_without_record() {
        let sink = OutputSink::new(Arc::new(NullSurface));
        assert!(sink.bind(3));
        let status = build_message("status", json!({"execution_state": "idle"})).unwrap();
        assert_eq!(sink.apply_for(3, &status), Some(None));
        assert!(sink.is_empty());
    }
}
