//! Stage definition for table-driven pipeline execution.

/// An ordered group of tasks.
///
/// Stages run in order, and a stage's tasks run one after another; a task
/// starts only once the previous one has completed.
#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub tasks: Vec<T>,
}

impl<T> Stage<T> {
    pub fn sequential(tasks: Vec<T>) -> Self {
        Self { tasks }
    }
}
