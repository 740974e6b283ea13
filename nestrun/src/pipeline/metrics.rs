#[derive(Debug, Clone)]
pub struct TaskMetrics {
    pub name: String,
    pub duration_ms: u128,
}

#[derive(Debug, Clone)]
pub struct StageMetrics {
    pub index: usize,
    pub duration_ms: u128,
    pub tasks: Vec<TaskMetrics>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub total_duration_ms: u128,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn task_duration_ms(&self, name: &str) -> Option<u128> {
        self.tasks().find(|task| task.name == name).map(|task| task.duration_ms)
    }

    /// Every task's metrics, in execution order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskMetrics> {
        self.stages.iter().flat_map(|stage| stage.tasks.iter())
    }

    /// Log one line per task plus the total.
    pub fn log(&self) {
        for task in self.tasks() {
            tracing::debug!(task = %task.name, duration_ms = task.duration_ms as u64, "Stage timing");
        }
        tracing::info!(
            total_ms = self.total_duration_ms as u64,
            stages = self.stages.len(),
            "Bootstrap pipeline finished"
        );
    }
}
