//! [`Program`] is a wrapper around [`aya::Ebpf`] which:
//! - loads a compiled probe object and attaches its programs
//! - drains ring buffer maps into bounded channels
//!
//! Dropping the [`Program`] detaches the probe and stops every reader task.
use core::fmt;
use std::{
    collections::HashSet,
    convert::TryFrom,
    fmt::Display,
    path::{Path, PathBuf},
};

use aya::{
    Ebpf, EbpfError, EbpfLoader,
    maps::{Map, MapData, MapError, RingBuf},
    programs::TracePoint,
};
use thiserror::Error;
use tokio::{
    io::{Interest, unix::AsyncFd},
    sync::{mpsc, watch},
    task::JoinError,
};

use crate::log_error;

#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("reading probe object {path}")]
    ReadingProbe {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("loading probe")]
    LoadingProbe(#[from] EbpfError),
    #[error("program not found {0}")]
    ProgramNotFound(String),
    #[error("incorrect program type {0}")]
    ProgramTypeError(String),
    #[error("failed program load {program}")]
    ProgramLoadError {
        program: String,
        #[source]
        program_error: Box<aya::programs::ProgramError>,
    },
    #[error("failed program attach {program}")]
    ProgramAttachError {
        program: String,
        #[source]
        program_error: Box<aya::programs::ProgramError>,
    },
    #[error(transparent)]
    MapError(#[from] MapError),
    #[error("map not found {0}")]
    MapNotFound(String),
    #[error("map already used {0}")]
    MapAlreadyUsed(String),
    #[error("polling ring buffer {0}")]
    RingBufPoll(#[source] std::io::Error),
    #[error("running background aya task {0}")]
    JoinError(#[from] JoinError),
}

pub struct ProgramBuilder {
    /// probe name, used for logging purposes
    name: &'static str,
    /// compiled BPF object
    probe_path: PathBuf,
    programs: Vec<ProgramType>,
}

impl ProgramBuilder {
    pub fn new(name: &'static str, probe_path: impl AsRef<Path>) -> Self {
        Self {
            name,
            probe_path: probe_path.as_ref().to_path_buf(),
            programs: Vec::new(),
        }
    }

    pub fn tracepoint(mut self, category: &str, program: &str, tracepoint: &str) -> Self {
        self.programs.push(ProgramType::TracePoint {
            category: category.to_string(),
            program: program.to_string(),
            tracepoint: tracepoint.to_string(),
        });
        self
    }

    /// Load the probe object and attach every registered program.
    pub async fn start(self) -> Result<Program, ProgramError> {
        // Readers are async tasks: they can't block on the probe going away, so
        // they watch a channel that closes when the Program is dropped.
        let (tx_exit, _) = watch::channel(());
        let name = self.name;

        let bpf = tokio::task::spawn_blocking(move || {
            let probe = std::fs::read(&self.probe_path).map_err(|source| {
                ProgramError::ReadingProbe {
                    path: self.probe_path.clone(),
                    source,
                }
            })?;
            let mut bpf = EbpfLoader::new().load(&probe)?;
            for program in &self.programs {
                program.attach(&mut bpf)?;
                log::debug!(target: name, "attached {program}");
            }
            Result::<Ebpf, ProgramError>::Ok(bpf)
        })
        .await??;

        Ok(Program {
            tx_exit,
            name,
            bpf,
            used_maps: Default::default(),
        })
    }
}

enum ProgramType {
    TracePoint {
        category: String,
        program: String,
        tracepoint: String,
    },
}

impl Display for ProgramType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramType::TracePoint {
                category,
                program,
                tracepoint,
            } => write!(f, "tracepoint {category}/{tracepoint} ({program})"),
        }
    }
}

impl ProgramType {
    fn attach(&self, bpf: &mut Ebpf) -> Result<(), ProgramError> {
        let load_err = |program_error| ProgramError::ProgramLoadError {
            program: self.to_string(),
            program_error: Box::new(program_error),
        };
        let attach_err = |program_error| ProgramError::ProgramAttachError {
            program: self.to_string(),
            program_error: Box::new(program_error),
        };
        match self {
            ProgramType::TracePoint {
                category,
                program,
                tracepoint,
            } => {
                let program: &mut TracePoint = extract_program(bpf, program)?;
                program.load().map_err(load_err)?;
                program.attach(category, tracepoint).map_err(attach_err)?;
            }
        }
        Ok(())
    }
}

fn extract_program<'a, T>(bpf: &'a mut Ebpf, program: &str) -> Result<&'a mut T, ProgramError>
where
    T: 'a,
    &'a mut T: TryFrom<&'a mut aya::programs::Program>,
{
    bpf.program_mut(program)
        .ok_or_else(|| ProgramError::ProgramNotFound(program.to_string()))?
        .try_into()
        .map_err(|_err| ProgramError::ProgramTypeError(program.to_string()))
}

pub struct Program {
    /// Closed on drop to stop the reader tasks.
    tx_exit: watch::Sender<()>,
    name: &'static str,
    bpf: Ebpf,
    used_maps: HashSet<String>,
}

impl Program {
    /// Drain a `BPF_MAP_TYPE_RINGBUF` map into `sender`.
    ///
    /// Every record goes through `decode`; records failing to decode are logged
    /// and dropped. When `sender` is full the reader waits for room and stops
    /// draining the ring buffer in the meantime: a slow consumer makes the kernel
    /// side drop records once the ring buffer fills up.
    pub fn read_ring_buffer<T, E, D>(
        &mut self,
        map_name: &str,
        decode: D,
        sender: mpsc::Sender<T>,
    ) -> Result<(), ProgramError>
    where
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<T, E> + Send + 'static,
    {
        let map_resource = self.take_map(map_name)?;
        let ring_buf: RingBuf<MapData> = RingBuf::try_from(map_resource)?;
        let mut async_fd = AsyncFd::with_interest(ring_buf, Interest::READABLE)
            .map_err(ProgramError::RingBufPoll)?;

        let name = self.name;
        let mut rx_exit = self.tx_exit.subscribe();

        tokio::spawn(async move {
            loop {
                let batch = {
                    let mut guard = tokio::select! {
                        Err(_) = rx_exit.changed() => break,
                        guard = async_fd.readable_mut() => match guard {
                            Ok(guard) => guard,
                            Err(err) => {
                                log_error(name, "ring buffer poll failed", err);
                                break;
                            }
                        },
                    };

                    let mut batch = Vec::new();
                    let ring_buf = guard.get_inner_mut();
                    while let Some(item) = ring_buf.next() {
                        match decode(&*item) {
                            Ok(record) => batch.push(record),
                            Err(err) => log_error(name, "dropping undecodable record", err),
                        }
                    }
                    guard.clear_ready();
                    batch
                };

                for record in batch {
                    tokio::select! {
                        Err(_) = rx_exit.changed() => return,
                        sent = sender.send(record) => if sent.is_err() {
                            log::debug!(target: name, "receiver closed, stop reading ring buffer");
                            return;
                        },
                    }
                }
            }
            log::debug!(target: name, "ring buffer reader stopped");
        });

        Ok(())
    }

    fn take_map(&mut self, map_name: &str) -> Result<Map, ProgramError> {
        if self.used_maps.contains(map_name) {
            return Err(ProgramError::MapAlreadyUsed(map_name.to_string()));
        };

        let map_resource = self
            .bpf
            .take_map(map_name)
            .ok_or_else(|| ProgramError::MapNotFound(map_name.to_string()))?;

        self.used_maps.insert(map_name.to_string());
        Ok(map_resource)
    }
}
