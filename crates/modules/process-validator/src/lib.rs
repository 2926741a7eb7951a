//! Allowlist validation of the processes started in pods.
//!
//! Every [`ExecEvent`] is checked against the cached constraints of its pod.
//! A process is allowed when one of the `allowedProcesses` regexes of a
//! matching constraint finds a match in the executed filename; anything else
//! is a violation. Violations are reported to the cluster agent, or turned
//! into new constraints for pods in registration mode.

use std::{ops::Deref, sync::Arc, time::Duration};

use chrono::Utc;
use exec_monitor::ExecEvent;
use regex::Regex;
use tokio::sync::mpsc;
use vigil_core::{
    PolicyCache, cache, matching,
    model::{
        AllowedProcessRule, Constraint, EVENT_TYPE_VIOLATION, Event, Pod, Process, Selector,
        Target,
    },
    pdk::{ConfigError, ModuleConfig, ModuleName, ShutdownSignal},
    service::{self, ConfigService, EventService, GetConstraintsRequest},
};

mod reporter;

pub use reporter::EventReporter;

pub const MODULE_NAME: ModuleName = "process-validator";

pub const THREAT_SCAN_ANNOTATION: &str = "vigil.dev/threat-scan";
pub const REGISTER_ANNOTATION: &str = "vigil.dev/register";

const GET_CONSTRAINTS_TIMEOUT: Duration = Duration::from_secs(5);

/// Pod label never copied into registered constraints: it changes on every rollout.
const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub enable_add_constraint: bool,
    /// Only validate pods carrying one of the scan annotations.
    pub require_annotation: bool,
}

impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            enable_add_constraint: config.with_default("enable_add_constraint", false)?,
            require_annotation: config.with_default("require_annotation", false)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Host process, not subject to constraints.
    Skipped,
    Allowed,
    Violation,
}

/// A [`Constraint`] with its `allowedProcesses` regexes compiled.
///
/// Empty regexes are dropped, invalid ones are logged and dropped.
#[derive(Debug, Clone)]
pub struct CompiledConstraint {
    constraint: Constraint,
    allowed_processes: Vec<Regex>,
}

impl CompiledConstraint {
    pub fn compile(name: ModuleName, constraint: Constraint) -> Self {
        let mut allowed_processes = Vec::new();
        let rules = constraint
            .allowed_processes
            .iter()
            .filter_map(|rule| rule.regex.as_deref())
            .filter(|regex| !regex.is_empty());
        for rule in rules {
            match Regex::new(rule) {
                Ok(regex) => allowed_processes.push(regex),
                Err(err) => bpf_common::log_error(
                    name,
                    &format!(
                        "skipping invalid allowed process regex of {}/{}",
                        constraint.namespace, constraint.name
                    ),
                    err,
                ),
            }
        }
        Self {
            constraint,
            allowed_processes,
        }
    }
}

impl Deref for CompiledConstraint {
    type Target = Constraint;

    fn deref(&self) -> &Constraint {
        &self.constraint
    }
}

pub fn compile_constraints(name: ModuleName, constraints: Vec<Constraint>) -> Vec<CompiledConstraint> {
    constraints
        .into_iter()
        .map(|constraint| CompiledConstraint::compile(name, constraint))
        .collect()
}

/// Classify `event` against `constraints`.
///
/// Host processes are skipped. Constraints without allowed processes don't
/// take part: they only govern files.
pub fn validate_process(
    name: ModuleName,
    event: &ExecEvent,
    constraints: &[CompiledConstraint],
) -> Verdict {
    if event.is_host_process() {
        return Verdict::Skipped;
    }

    let applicable = constraints.iter().filter(|constraint| {
        matching::constraint_matches_pod(constraint, &event.namespace, &event.pod_labels)
    });

    if is_allowed_process(name, applicable, &event.filename) {
        Verdict::Allowed
    } else {
        Verdict::Violation
    }
}

/// Whether an `allowedProcesses` regex of `constraints` matches `subject`.
pub fn is_allowed_process<'a>(
    name: ModuleName,
    constraints: impl IntoIterator<Item = &'a CompiledConstraint>,
    subject: &str,
) -> bool {
    constraints
        .into_iter()
        .flat_map(|constraint| &constraint.allowed_processes)
        .any(|regex| {
            log::trace!(target: name, "validating {subject} against {regex}");
            regex.is_match(subject)
        })
}

/// What happened to an exec event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Skipped,
    Allowed,
    Reported,
    Registered,
}

/// Consumes exec events and acts on violations.
pub struct ProcessValidator<C> {
    name: ModuleName,
    config: Config,
    constraints: Arc<PolicyCache<CompiledConstraint>>,
    reporter: EventReporter<C>,
}

impl<C> ProcessValidator<C>
where
    C: ConfigService + EventService,
{
    pub fn new(
        name: ModuleName,
        config: Config,
        constraints: Arc<PolicyCache<CompiledConstraint>>,
        reporter: EventReporter<C>,
    ) -> Self {
        Self {
            name,
            config,
            constraints,
            reporter,
        }
    }

    pub async fn run(self, mut events: mpsc::Receiver<ExecEvent>, mut shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle(event).await;
                    }
                    None => break,
                },
            }
        }
        log::debug!(target: self.name, "validation loop stopped");
    }

    pub async fn handle(&self, event: ExecEvent) -> Outcome {
        // until the first sync every process would look like a violation
        if !self.constraints.is_initialized() {
            return Outcome::Skipped;
        }

        let threat_scan = event.pod_annotations.contains_key(THREAT_SCAN_ANNOTATION);
        let register = event.pod_annotations.get(REGISTER_ANNOTATION);
        if self.config.require_annotation && !threat_scan && register.is_none() {
            return Outcome::Skipped;
        }
        if register.is_some() && !self.config.enable_add_constraint {
            return Outcome::Skipped;
        }

        let constraints = self.constraints.snapshot();
        match validate_process(self.name, &event, &constraints) {
            Verdict::Skipped => return Outcome::Skipped,
            Verdict::Allowed => return Outcome::Allowed,
            Verdict::Violation => {}
        }

        if register.is_some_and(|value| registers_processes(value)) {
            log::info!(
                target: self.name,
                "violated process {} in {}/{}, registering",
                event.command,
                event.namespace,
                event.pod_name
            );
            self.reporter
                .register_constraint(constraint_from_violation(&event))
                .await;
            Outcome::Registered
        } else {
            log::info!(
                target: self.name,
                "violated process {} in {}/{}",
                event.command,
                event.namespace,
                event.pod_name
            );
            self.reporter.report(violation_event(&event)).await;
            Outcome::Reported
        }
    }
}

/// Keep `constraints` in sync with `client` every `interval`.
pub async fn sync_constraints<C>(
    name: ModuleName,
    constraints: Arc<PolicyCache<CompiledConstraint>>,
    client: C,
    interval: Duration,
    shutdown: ShutdownSignal,
) where
    C: ConfigService,
{
    let client = &client;
    cache::sync_loop(
        name,
        constraints,
        interval,
        move || async move {
            let call = client.get_constraints(GetConstraintsRequest::default());
            service::with_timeout(GET_CONSTRAINTS_TIMEOUT, call)
                .await
                .map(|response| compile_constraints(name, response.constraints))
        },
        shutdown,
    )
    .await
}

/// `processes` or `all` in the comma separated register annotation.
pub fn registers_processes(annotation: &str) -> bool {
    annotation
        .split(',')
        .map(str::trim)
        .any(|rule| rule == "processes" || rule == "all")
}

pub fn violation_event(event: &ExecEvent) -> Event {
    Event::new(
        EVENT_TYPE_VIOLATION,
        Utc::now(),
        vec![Target {
            pod: Some(Pod::new(
                &event.pod_uid,
                &event.pod_name,
                &event.namespace,
                &event.pod_labels,
            )),
            violated_processes: vec![Process {
                pid: event.pid as i32,
                name: event.command.clone(),
            }],
            ..Default::default()
        }],
    )
}

/// Constraint allowing exactly the violating executable for pods labelled like this one.
pub fn constraint_from_violation(event: &ExecEvent) -> Constraint {
    let mut labels = event.pod_labels.clone();
    labels.remove(POD_TEMPLATE_HASH_LABEL);

    let hours = Utc::now().timestamp_nanos_opt().unwrap_or_default() / 3_600_000;
    let mut constraint = Constraint::new(
        event.namespace.clone(),
        format!("{}-{hours}", event.pod_name),
    );
    constraint.selector = Some(Selector::from_labels(&labels));
    constraint.allowed_processes = vec![AllowedProcessRule {
        regex: Some(format!("^{}$", regex::escape(&event.filename))),
    }];
    constraint
}
