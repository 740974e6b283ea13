//! Container and task lifecycle for the nested engine.

use std::fmt;

use chrono::{DateTime, Utc};
use nestrun_shared::records::{ContainerRecord, ExitStatus};
use nestrun_shared::{NestrunError, NestrunResult};
use oci_spec::runtime::Spec;

use super::io::TaskIo;
use crate::images::UnpackedImage;
use crate::runtime::RuntimeClient;

/// Lifecycle of the supervised task. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskState {
    Created,
    TaskCreated,
    WaitingRegistered,
    Started,
    Exited,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::TaskCreated => "task-created",
            TaskState::WaitingRegistered => "waiting-registered",
            TaskState::Started => "started",
            TaskState::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Reference to the daemon-owned container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub snapshot_key: String,
}

/// What the task left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExit {
    pub container: ContainerHandle,
    pub pid: u32,
    pub status: ExitStatus,
}

impl TaskExit {
    pub fn exit_code(&self) -> u32 {
        self.status.exit_code
    }

    /// Exit time reported by the daemon, if any.
    pub fn exited_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.status.exited_at.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }

    /// The exit as a result: an error attached by the daemon becomes
    /// [`NestrunError::ContainerExit`].
    pub fn into_result(self) -> NestrunResult<u32> {
        match self.status.error {
            Some(message) if !message.is_empty() => Err(NestrunError::ContainerExit {
                exit_code: self.status.exit_code,
                message,
            }),
            _ => Ok(self.status.exit_code),
        }
    }
}

/// One container launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    /// Container id, also its snapshot key.
    pub name: &'a str,
    pub image: &'a UnpackedImage,
    pub spec: Spec,
}

/// Creates, starts and waits on exactly one container task.
pub struct TaskSupervisor<'a> {
    client: &'a RuntimeClient,
    io: Option<TaskIo>,
    state: Option<TaskState>,
}

impl<'a> TaskSupervisor<'a> {
    pub fn new(client: &'a RuntimeClient) -> Self {
        Self {
            client,
            io: None,
            state: None,
        }
    }

    /// Use `io` for the task's stdio instead of this process's streams.
    pub fn with_io(mut self, io: TaskIo) -> Self {
        self.io = Some(io);
        self
    }

    /// Run the container to completion.
    ///
    /// The exit wait is acknowledged by the daemon before the task is
    /// started, so a task that exits immediately is still observed.
    pub async fn launch(mut self, request: LaunchRequest<'_>) -> NestrunResult<TaskExit> {
        let daemon = self.client.daemon();
        let ns = self.client.namespace();
        let image = request.image;
        let container = ContainerHandle {
            id: request.name.to_string(),
            snapshot_key: request.name.to_string(),
        };

        daemon
            .snapshot_prepare(ns, &image.snapshotter, &container.snapshot_key, &image.chain_id)
            .await?;
        daemon
            .container_create(
                ns,
                ContainerRecord {
                    id: container.id.clone(),
                    image: image.image.name.clone(),
                    snapshotter: image.snapshotter.clone(),
                    snapshot_key: container.snapshot_key.clone(),
                    spec: request.spec,
                    labels: image.labels(),
                },
            )
            .await?;
        self.transition(&container, TaskState::Created);

        let io = match self.io.take() {
            Some(io) => io,
            None => TaskIo::create()?,
        };
        let pid = daemon.task_create(ns, &container.id, io.stdio()).await?;
        self.transition(&container, TaskState::TaskCreated);

        let waiter = daemon.task_wait(ns, &container.id).await?;
        self.transition(&container, TaskState::WaitingRegistered);

        daemon.task_start(ns, &container.id).await?;
        self.transition(&container, TaskState::Started);
        tracing::info!(container = %container.id, pid, "Engine started");

        let status = waiter.wait().await;
        io.finish().await;
        let status = status?;
        self.transition(&container, TaskState::Exited);

        tracing::info!(
            container = %container.id,
            exit_code = status.exit_code,
            error = status.error.as_deref().unwrap_or(""),
            "Engine exited"
        );

        Ok(TaskExit {
            container,
            pid,
            status,
        })
    }

    fn transition(&mut self, container: &ContainerHandle, next: TaskState) {
        debug_assert!(self.state.is_none_or(|s| s < next));
        tracing::debug!(
            container = %container.id,
            from = %self.state.map(|s| s.to_string()).unwrap_or_else(|| "none".into()),
            to = %next,
            "Task state"
        );
        self.state = Some(next);
    }
}
