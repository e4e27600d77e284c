//! Execution and comm bridge between a code editor and a remote Jupyter
//! kernel.
//!
//! Running code goes through the [`ExecutionCoordinator`], which routes the
//! kernel's output into an [`OutputSink`] and widget-state payloads into a
//! [`WidgetHydrator`]. Kernel-opened widget comms are announced to the
//! widget runtime by the [`CommRegistrar`], wrapped in the classic comm
//! shape by [`CommAdapter`].

pub mod bridge;
pub mod comm;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod execution;
pub mod hydrator;
pub mod jupyter;
pub mod output;
pub mod registrar;
pub mod session;
pub mod widgets;
pub mod wire;

pub use bridge::Bridge;
pub use comm::{ClassicCommView, CommAdapter};
pub use config::BridgeConfig;
pub use context::SessionContext;
pub use error::{BridgeError, Result};
pub use execution::{ExecutionCoordinator, ExecutionHandle, ExecutionOutcome};
pub use hydrator::WidgetHydrator;
pub use jupyter::JupyterSession;
pub use output::{OutputRecord, OutputSink, OutputSurface};
pub use registrar::CommRegistrar;
pub use session::{Comm, ExecutionFuture, KernelSession};
pub use widgets::{WidgetModelStore, WidgetRuntime};
