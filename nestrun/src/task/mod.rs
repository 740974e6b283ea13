//! Launch and supervision of the nested container's task.

mod io;
mod supervisor;

pub use io::TaskIo;
pub use nestrun_shared::records::ExitStatus;
pub use supervisor::{ContainerHandle, LaunchRequest, TaskExit, TaskState, TaskSupervisor};
