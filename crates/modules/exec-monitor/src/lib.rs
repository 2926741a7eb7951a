//! Exec pipeline of the node agent.
//!
//! The probe reports every `execve` as an [`ExecRecord`]. Records are
//! correlated to a container through procfs, then to a pod through the
//! [`PodIndex`], and come out as [`ExecEvent`]s. Records of host processes,
//! exited processes and pods not indexed yet are dropped.
//!
//! Both queues of the pipeline are bounded to [`QUEUE_CAPACITY`] and block
//! when full: a slow validator stalls the ring buffer reader, and the kernel
//! drops records once the ring buffer itself is full.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use bpf_common::{
    Pid, Program, ProgramBuilder, ProgramError,
    parsing::{exec_record::ExecRecord, procfs::get_process_container_id},
};
use kube_client::PodIndex;
use tokio::sync::mpsc;
use vigil_core::{
    model::Labels,
    pdk::{ConfigError, ModuleConfig, ModuleName, ShutdownSignal},
};

pub const MODULE_NAME: ModuleName = "exec-monitor";
pub const QUEUE_CAPACITY: usize = 1000;

const DEFAULT_PROBE_PATH: &str = "/usr/lib/vigil/capture_exec.bpf.o";
const DEFAULT_HOST_PROC_DIR: &str = "/host/proc";

#[derive(Debug, Clone)]
pub struct Config {
    pub probe_path: PathBuf,
    pub host_proc_dir: PathBuf,
}

impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            probe_path: config.with_default("probe_path", PathBuf::from(DEFAULT_PROBE_PATH))?,
            host_proc_dir: config
                .with_default("host_proc_dir", PathBuf::from(DEFAULT_HOST_PROC_DIR))?,
        })
    }
}

/// A process started inside a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecEvent {
    pub pid: u32,
    pub command: String,
    pub filename: String,
    pub container_id: String,
    pub pod_uid: String,
    pub pod_name: String,
    pub namespace: String,
    pub pod_labels: Labels,
    pub pod_annotations: BTreeMap<String, String>,
}

impl ExecEvent {
    /// Host processes carry no pod identity.
    pub fn is_host_process(&self) -> bool {
        self.namespace.is_empty() || self.pod_name.is_empty()
    }
}

/// The attached exec probe. Dropping it detaches the probe and closes the
/// record queue.
pub struct ExecSource {
    program: Program,
}

impl ExecSource {
    /// Load the probe from `probe_path` and start draining its ring buffer.
    pub async fn start(
        probe_path: &Path,
    ) -> Result<(Self, mpsc::Receiver<ExecRecord>), ProgramError> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let mut program = ProgramBuilder::new(MODULE_NAME, probe_path)
            .tracepoint("syscalls", "enter_execve", "sys_enter_execve")
            .start()
            .await?;
        program.read_ring_buffer("events", ExecRecord::decode, tx)?;
        log::info!(target: MODULE_NAME, "exec probe attached");
        Ok((Self { program }, rx))
    }

    pub fn close(self) {
        drop(self.program);
        log::info!(target: MODULE_NAME, "exec probe detached");
    }
}

/// Maps exec records to the pod running them.
pub struct Correlator {
    proc_root: PathBuf,
    pods: PodIndex,
}

impl Correlator {
    pub fn new(proc_root: impl Into<PathBuf>, pods: PodIndex) -> Self {
        Self {
            proc_root: proc_root.into(),
            pods,
        }
    }

    pub fn correlate(&self, record: ExecRecord) -> Option<ExecEvent> {
        let pid = Pid::from_raw(i32::try_from(record.pid).ok()?);
        let container_id = match get_process_container_id(&self.proc_root, pid) {
            Ok(Some(container_id)) => container_id,
            Ok(None) => return None,
            Err(err) => {
                // usually a short-lived process already gone
                log::trace!(target: MODULE_NAME, "{err}");
                return None;
            }
        };

        let Some(pod) = self.pods.find_pod(&container_id) else {
            log::trace!(target: MODULE_NAME, "no pod found for container {container_id}");
            return None;
        };

        Some(ExecEvent {
            pid: record.pid,
            command: record.command,
            filename: record.filename,
            container_id,
            pod_uid: pod.metadata.uid.clone(),
            pod_name: pod.metadata.name.clone(),
            namespace: pod.metadata.namespace.clone(),
            pod_labels: pod.metadata.labels.clone(),
            pod_annotations: pod.metadata.annotations.clone(),
        })
    }
}

/// Correlate `records` into `events` until shutdown or until the source closes.
pub async fn run(
    correlator: Correlator,
    mut records: mpsc::Receiver<ExecRecord>,
    events: mpsc::Sender<ExecEvent>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        let record = tokio::select! {
            _ = shutdown.recv() => break,
            record = records.recv() => match record {
                Some(record) => record,
                None => {
                    log::warn!(target: MODULE_NAME, "exec record source closed");
                    break;
                }
            },
        };

        let Some(event) = correlator.correlate(record) else {
            continue;
        };

        tokio::select! {
            _ = shutdown.recv() => break,
            sent = events.send(event) => if sent.is_err() {
                break;
            },
        }
    }
    log::debug!(target: MODULE_NAME, "exec pipeline stopped");
}
