//! One-stop assembly of the bridge components.

use std::sync::Arc;

use crate::config::BridgeConfig;
use crate::context::{CodeAccessor, SessionContext};
use crate::diagnostics::MessageTap;
use crate::error::Result;
use crate::execution::{ExecutionCoordinator, ExecutionHandle};
use crate::hydrator::WidgetHydrator;
use crate::output::{OutputSink, OutputSurface};
use crate::registrar::CommRegistrar;
use crate::session::KernelSession;
use crate::widgets::WidgetRuntime;

/// Registrar, context and coordinator wired to one widget runtime and one
/// output surface.
pub struct Bridge {
    config: BridgeConfig,
    context: Arc<SessionContext>,
    coordinator: ExecutionCoordinator,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        runtime: Arc<dyn WidgetRuntime>,
        surface: Arc<dyn OutputSurface>,
    ) -> Self {
        let registrar = CommRegistrar::new(config.widget_target_name.clone(), runtime.clone());
        let context = Arc::new(SessionContext::new(registrar));
        context.set_output(OutputSink::new(surface));

        let hydrator = WidgetHydrator::new(runtime, config.widget_state_mime.clone());
        let coordinator = ExecutionCoordinator::new(context.clone(), hydrator);

        Self {
            config,
            context,
            coordinator,
        }
    }

    pub fn with_tap(mut self, tap: Arc<dyn MessageTap>) -> Self {
        self.coordinator = self.coordinator.with_tap(tap);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    pub fn registrar(&self) -> &CommRegistrar {
        self.context.registrar()
    }

    pub fn output(&self) -> Option<OutputSink> {
        self.context.output()
    }

    pub fn connect(&self, session: Arc<dyn KernelSession>) {
        self.context.connect(session);
    }

    pub fn disconnect(&self) {
        self.context.disconnect();
    }

    pub fn mount_editor(&self, accessor: CodeAccessor) {
        self.context.mount_editor(accessor);
    }

    pub fn execute(&self, code: &str) -> Result<ExecutionHandle> {
        self.coordinator.execute(code)
    }

    pub fn execute_current(&self) -> Result<ExecutionHandle> {
        self.coordinator.execute_current()
    }
}
