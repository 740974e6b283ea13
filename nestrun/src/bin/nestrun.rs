//! nestrun: import, unpack and launch the engine container, then mirror its exit code.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use nestrun::fs::{MountSpec, RollbackPolicy};
use nestrun::logging::init_logging;
use nestrun::runtime::constants::defaults;
use nestrun::spec::HostNamespace;
use nestrun::{Bootstrap, BootstrapOptions, NestrunError};

#[derive(Debug, Parser)]
#[command(name = "nestrun")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Daemon control socket.
    #[arg(long, env = "NESTRUN_ADDRESS", default_value = defaults::DAEMON_ADDRESS)]
    address: PathBuf,

    #[arg(long, env = "NESTRUN_NAMESPACE", default_value = defaults::NAMESPACE)]
    namespace: String,

    /// OCI image archive to import.
    #[arg(long, env = "NESTRUN_IMAGE", default_value = defaults::IMAGE_ARCHIVE)]
    image: PathBuf,

    /// Name of the image targeting the archive's whole index.
    #[arg(long, env = "NESTRUN_INDEX_NAME", default_value = defaults::INDEX_NAME)]
    index_name: String,

    /// Do not create an image for the whole index.
    #[arg(long, conflicts_with = "index_name")]
    no_index_name: bool,

    #[arg(long, env = "NESTRUN_SNAPSHOTTER", default_value = defaults::SNAPSHOTTER)]
    snapshotter: String,

    /// Container name, also used as its snapshot key.
    #[arg(long, env = "NESTRUN_CONTAINER", default_value = defaults::CONTAINER_NAME)]
    name: String,

    /// Host directory to self-bind and share (repeatable). Replaces the default list.
    #[arg(long = "host-mount", value_name = "PATH")]
    host_mounts: Vec<PathBuf>,

    /// Namespace to share with the host (repeatable). Defaults to network.
    #[arg(long = "share-host-namespace", value_enum)]
    host_namespaces: Vec<HostNamespace>,

    /// Detach completed host mounts when a later one fails.
    #[arg(long)]
    unmount_on_failure: bool,

    /// Also write logs to `<DIR>/nestrun.log`.
    #[arg(long, env = "NESTRUN_LOG_DIR", value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Arguments appended to the image entrypoint. Defaults to `--debug`.
    #[arg(last = true)]
    args: Vec<String>,
}

impl Args {
    fn into_options(self) -> BootstrapOptions {
        let mut options = BootstrapOptions {
            daemon_address: self.address,
            namespace: self.namespace,
            image_archive: self.image,
            index_name: (!self.no_index_name).then_some(self.index_name),
            snapshotter: self.snapshotter,
            container_name: self.name,
            log_dir: self.log_dir,
            ..Default::default()
        };

        if !self.host_mounts.is_empty() {
            options.host_mounts = self.host_mounts.into_iter().map(MountSpec::self_bound).collect();
        }
        if !self.host_namespaces.is_empty() {
            options.host_namespaces = self.host_namespaces;
        }
        if self.unmount_on_failure {
            options.rollback = RollbackPolicy::Unmount;
        }
        if !self.args.is_empty() {
            options.extra_args = self.args;
        }
        options
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let options = Args::parse().into_options();

    let _guard = match init_logging(options.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("nestrun: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(options).await {
        Ok(code) => exit_code(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            match e.downcast_ref::<NestrunError>() {
                Some(NestrunError::ContainerExit { exit_code: code, .. }) if *code != 0 => {
                    exit_code(*code)
                }
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(options: BootstrapOptions) -> Result<u32> {
    let outcome = Bootstrap::new(options)
        .run()
        .await
        .context("nested container bootstrap failed")?;
    Ok(outcome.exit_code())
}

fn exit_code(code: u32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}
