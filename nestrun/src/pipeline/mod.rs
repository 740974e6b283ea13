//! Generic table-driven pipeline execution.
//!
//! ```text
//! Pipeline → Stages → Tasks
//!
//! - Pipeline: runs every stage in order
//! - Stage: ordered group of tasks, each awaited before the next starts
//! - Task: atomic unit of work on a shared context
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use pipeline::{ExecutionPlan, PipelineBuilder, PipelineExecutor, Stage};
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! let plan = ExecutionPlan::new(vec![
//!     Stage::sequential(vec![Box::new(TaskA)]),
//!     Stage::sequential(vec![Box::new(TaskB)]),
//! ]);
//!
//! let ctx = Arc::new(Mutex::new(Context));
//! let pipeline = PipelineBuilder::from_plan(plan);
//! let metrics = PipelineExecutor::execute(pipeline, ctx).await?;
//! println!("pipeline took {}ms", metrics.total_duration_ms);
//! ```

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;

pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use pipeline::{ExecutionPlan, Pipeline, PipelineBuilder, PipelineExecutor};
pub use stage::Stage;
pub use task::{BoxedTask, PipelineTask};
