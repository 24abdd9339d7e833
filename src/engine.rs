//! Reconciliation state machine
//!
//! The engine converts input-change events into the minimal set of
//! installation and service actions needed to converge the running
//! service on the desired state. Transitions are pure functions over
//! `(Phase, ReconcileContext, Event)`; a single driver loop executes
//! the resulting effects against the installer and supervisor traits
//! and feeds outcome events back onto the queue. One event is processed
//! to completion before the next is dequeued.

use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::config::StaticConfig;
use crate::error::Error;
use crate::install::{self, Installer};
use crate::relation::{self, RelationKind, UnitFields};
use crate::render::{self, DesiredState};
use crate::service::{self, Supervisor};
use crate::state::StewardState;

/// Phase of the reconciliation state machine.
///
/// The machine is long-lived: there is no terminal phase, and `Active`
/// is re-entered indefinitely as inputs change. `Degraded` holds the
/// reason for status reporting and is left as soon as a qualifying
/// input-change event arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Init,
    AwaitingSource,
    InstallingDeps,
    Provisioning,
    Configuring,
    Starting,
    Active,
    Degraded(String),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::AwaitingSource => f.write_str("awaiting-source"),
            Self::InstallingDeps => f.write_str("installing-deps"),
            Self::Provisioning => f.write_str("provisioning"),
            Self::Configuring => f.write_str("configuring"),
            Self::Starting => f.write_str("starting"),
            Self::Active => f.write_str("active"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
        }
    }
}

/// An input-change notification or an internal stage outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // External events, delivered by the orchestration layer
    ConfigChanged,
    SourceAvailable,
    RelationJoined {
        kind: RelationKind,
        unit: String,
        data: UnitFields,
    },
    RelationChanged {
        kind: RelationKind,
        unit: String,
        data: UnitFields,
    },
    RelationDeparted {
        kind: RelationKind,
        unit: String,
    },
    /// Re-evaluate against current inputs without a specific trigger
    Resync,

    // Internal outcomes, produced by effect execution
    DepsInstalled,
    DepsFailed(String),
    Provisioned,
    ProvisionFailed(String),
    /// Desired state matches the applied state and the service runs
    ServiceUnchanged,
    /// Desired state differs from the applied state, or the service is
    /// not running
    ServiceStale,
    ServiceApplied {
        hash: String,
    },
    ApplyFailed(String),
}

/// Side effects a transition requests from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Ensure OS packages, the service user, and pip requirements
    InstallDependencies,
    /// Run the provision command
    RunProvision,
    /// Compare rendered desired state against the applied hash
    CompareService,
    /// Write the service definition and (re)start the service
    ApplyService,
    /// Publish the listening endpoint for the reverse proxy
    PublishWebsite,
}

/// Snapshot of the inputs a transition may branch on. Computed by the
/// driver before each event so the transition function stays pure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileContext {
    /// The application source has been staged
    pub source_available: bool,
    /// Dependencies are installed and their fingerprint is current
    pub deps_current: bool,
    /// A provision command is configured
    pub needs_provision: bool,
    /// Relation kinds in conflict, if resolution failed
    pub conflict: Option<String>,
}

/// Result of a transition: the next phase and the effects to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: Phase,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: Phase) -> Self {
        Self {
            next,
            effects: Vec::new(),
        }
    }

    fn with(next: Phase, effect: Effect) -> Self {
        Self {
            next,
            effects: vec![effect],
        }
    }
}

/// The transition table.
///
/// Pure function: no IO, no mutation. External events always route
/// through the same precondition ladder, so repeated or out-of-order
/// delivery converges on the same phase. A degraded machine re-enters
/// through the installation stage, which is idempotent.
pub fn transition(phase: &Phase, ctx: &ReconcileContext, event: &Event) -> Transition {
    match event {
        Event::ConfigChanged
        | Event::SourceAvailable
        | Event::RelationJoined { .. }
        | Event::RelationChanged { .. }
        | Event::RelationDeparted { .. }
        | Event::Resync => {
            if !ctx.source_available {
                Transition::to(Phase::AwaitingSource)
            } else if let Some(kinds) = &ctx.conflict {
                Transition::to(Phase::Degraded(
                    Error::ConfigConflict {
                        kinds: kinds.clone(),
                    }
                    .to_string(),
                ))
            } else if !ctx.deps_current || matches!(phase, Phase::Degraded(_)) {
                Transition::with(Phase::InstallingDeps, Effect::InstallDependencies)
            } else {
                Transition::with(Phase::Configuring, Effect::CompareService)
            }
        }
        Event::DepsInstalled => {
            if ctx.needs_provision {
                Transition::with(Phase::Provisioning, Effect::RunProvision)
            } else {
                Transition::with(Phase::Configuring, Effect::CompareService)
            }
        }
        Event::Provisioned => Transition::with(Phase::Configuring, Effect::CompareService),
        Event::ServiceStale => Transition::with(Phase::Starting, Effect::ApplyService),
        Event::ServiceUnchanged => Transition::to(Phase::Active),
        Event::ServiceApplied { .. } => {
            Transition::with(Phase::Active, Effect::PublishWebsite)
        }
        Event::DepsFailed(reason)
        | Event::ProvisionFailed(reason)
        | Event::ApplyFailed(reason) => Transition::to(Phase::Degraded(reason.clone())),
    }
}

/// Driver for the reconciliation state machine.
///
/// Owns the ordered event queue and the persisted state; executes
/// effects against the injected installer and supervisor. Relation
/// data is merged into the store when its event is dequeued, so every
/// event observes the latest aggregated relation state.
pub struct Engine<I: Installer, S: Supervisor> {
    config: StaticConfig,
    state: StewardState,
    state_dir: PathBuf,
    installer: I,
    supervisor: S,
    queue: VecDeque<Event>,
}

impl<I: Installer, S: Supervisor> Engine<I, S> {
    pub fn new(
        config: StaticConfig,
        state: StewardState,
        state_dir: PathBuf,
        installer: I,
        supervisor: S,
    ) -> Self {
        Self {
            config,
            state,
            state_dir,
            installer,
            supervisor,
            queue: VecDeque::new(),
        }
    }

    /// Append an event to the queue
    pub fn submit(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    /// Process queued events in arrival order until the queue drains.
    ///
    /// State is persisted after every processed event, so a crash
    /// mid-run loses at most the in-flight stage.
    pub fn run(&mut self) -> Result<()> {
        while let Some(event) = self.queue.pop_front() {
            self.process(event)?;
        }
        Ok(())
    }

    /// Current persisted state
    pub fn state(&self) -> &StewardState {
        &self.state
    }

    /// Hand the state back, e.g. to carry it into a later pass
    pub fn into_state(self) -> StewardState {
        self.state
    }

    /// Borrow the injected installer (used by tests to inspect call counts
    /// while the engine is still live).
    #[cfg(test)]
    fn installer(&self) -> &I {
        &self.installer
    }

    fn process(&mut self, event: Event) -> Result<()> {
        log::debug!("Processing event: {event:?}");
        self.intake(&event);

        let ctx = self.context();
        let Transition { next, effects } = transition(&self.state.phase, &ctx, &event);

        if next != self.state.phase {
            log::info!("Phase {} -> {}", self.state.phase, next);
        }
        self.state.phase = next;

        for effect in effects {
            if let Some(outcome) = self.execute(effect) {
                self.queue.push_front(outcome);
            }
        }

        self.state.save(&self.state_dir)
    }

    /// Fold an external event's payload into the persisted inputs
    /// before the transition looks at them.
    fn intake(&mut self, event: &Event) {
        match event {
            Event::SourceAvailable => {
                if !self.state.flags.source_available {
                    log::info!("Application source is available");
                }
                self.state.flags.source_available = true;
            }
            Event::RelationJoined { kind, unit, data }
            | Event::RelationChanged { kind, unit, data } => {
                log::debug!("Merging {} fields for {kind} unit {unit}", data.len());
                self.state.relations.merge(*kind, unit, data);
            }
            Event::RelationDeparted { kind, unit } => {
                log::info!("Relation {kind} unit {unit} departed");
                self.state.relations.remove(*kind, unit);
            }
            _ => {}
        }
    }

    fn context(&self) -> ReconcileContext {
        let conflict = match relation::resolve(&self.state.relations) {
            Err(Error::ConfigConflict { kinds }) => Some(kinds),
            _ => None,
        };
        let fingerprint = install::fingerprint(&self.config);

        ReconcileContext {
            source_available: self.state.flags.source_available,
            deps_current: self.state.flags.dependencies_installed
                && self.state.deps_fingerprint.as_deref() == Some(fingerprint.as_str()),
            needs_provision: self.config.provision_command.is_some(),
            conflict,
        }
    }

    /// Render the desired state from current inputs.
    ///
    /// `None` when a precondition is missing; the next external event
    /// re-routes the machine, so nothing is reported here.
    fn desired(&self) -> Option<DesiredState> {
        let descriptor = match relation::resolve(&self.state.relations) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                log::warn!("Relation resolution failed mid-pass: {e}");
                return None;
            }
        };

        match render::render(
            &self.config,
            &descriptor,
            self.state.flags.source_available,
        ) {
            Ok(desired) => Some(desired),
            Err(e) if e.is_blocking() => {
                log::warn!("Render failed mid-pass: {e}");
                None
            }
            Err(e) => {
                log::debug!("Desired state not renderable yet: {e}");
                None
            }
        }
    }

    fn execute(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::InstallDependencies => {
                let environment = self.desired()?.environment;
                match self.installer.ensure(&self.config, &environment) {
                    Ok(()) => {
                        self.state.flags.dependencies_installed = true;
                        self.state.deps_fingerprint = Some(install::fingerprint(&self.config));
                        Some(Event::DepsInstalled)
                    }
                    Err(e) => Some(Event::DepsFailed(e.to_string())),
                }
            }
            Effect::RunProvision => {
                let environment = self.desired()?.environment;
                match self.installer.provision(&self.config, &environment) {
                    Ok(()) => Some(Event::Provisioned),
                    Err(e) => Some(Event::ProvisionFailed(e.to_string())),
                }
            }
            Effect::CompareService => {
                let desired = self.desired()?;
                let hash = desired.hash();
                let unchanged = self.state.applied_hash.as_deref() == Some(hash.as_str())
                    && self.supervisor.is_running(&self.config.service_name);

                if unchanged {
                    log::debug!("Desired state unchanged ({hash}), service running");
                    Some(Event::ServiceUnchanged)
                } else {
                    Some(Event::ServiceStale)
                }
            }
            Effect::ApplyService => {
                let desired = self.desired()?;
                match self.supervisor.apply(&desired) {
                    Ok(()) => {
                        let hash = desired.hash();
                        self.state.applied_hash = Some(hash.clone());
                        self.state.flags.service_configured = true;
                        self.state.flags.service_active = true;
                        Some(Event::ServiceApplied { hash })
                    }
                    Err(e) => Some(Event::ApplyFailed(e.to_string())),
                }
            }
            Effect::PublishWebsite => {
                if let Err(e) = service::publish_website(&self.state_dir, self.config.port) {
                    log::warn!("Failed to publish website endpoint: {e:#}");
                }
                None
            }
        }
    }
}

// ============================================================================
// Pass lock
// ============================================================================

const LOCK_ATTEMPTS: u32 = 120;
const LOCK_PAUSE: Duration = Duration::from_millis(500);

/// Exclusive lock held for the duration of a reconciliation pass.
///
/// Acquisition order across invocations is the arrival order of the
/// events they deliver; a second invocation waits here until the
/// current pass completes.
pub struct PassLock {
    path: PathBuf,
}

impl PassLock {
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join("pass.lock");

        for attempt in 0..LOCK_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if attempt == 0 {
                        log::info!("Waiting for in-progress pass to complete");
                    }
                    thread::sleep(LOCK_PAUSE);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create lock at {}", path.display()));
                }
            }
        }

        bail!("timed out waiting for pass lock at {}", path.display())
    }
}

impl Drop for PassLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct MockInstaller {
        ensure_calls: usize,
        provision_calls: usize,
        fail_ensure: bool,
    }

    impl MockInstaller {
        fn new() -> Self {
            Self {
                ensure_calls: 0,
                provision_calls: 0,
                fail_ensure: false,
            }
        }
    }

    impl Installer for MockInstaller {
        fn ensure(
            &mut self,
            _config: &StaticConfig,
            _environment: &BTreeMap<String, String>,
        ) -> Result<(), Error> {
            self.ensure_calls += 1;
            if self.fail_ensure {
                return Err(Error::InstallFailure {
                    detail: "apt-get exited 100".to_string(),
                });
            }
            Ok(())
        }

        fn provision(
            &mut self,
            _config: &StaticConfig,
            _environment: &BTreeMap<String, String>,
        ) -> Result<(), Error> {
            self.provision_calls += 1;
            Ok(())
        }
    }

    struct MockSupervisor {
        apply_calls: usize,
        running: bool,
        fail_apply: bool,
    }

    impl MockSupervisor {
        fn new() -> Self {
            Self {
                apply_calls: 0,
                running: false,
                fail_apply: false,
            }
        }
    }

    impl Supervisor for MockSupervisor {
        fn apply(&mut self, _desired: &DesiredState) -> Result<(), Error> {
            self.apply_calls += 1;
            if self.fail_apply {
                return Err(Error::ApplyFailure {
                    detail: "daemon-reload failed".to_string(),
                });
            }
            self.running = true;
            Ok(())
        }

        fn is_running(&self, _service_name: &str) -> bool {
            self.running
        }

        fn stop(&mut self, _service_name: &str) -> Result<(), Error> {
            self.running = false;
            Ok(())
        }
    }

    fn make_engine<'a>(
        config: StaticConfig,
        state: StewardState,
        dir: &Path,
        installer: &'a mut MockInstaller,
        supervisor: &'a mut MockSupervisor,
    ) -> Engine<&'a mut MockInstaller, &'a mut MockSupervisor> {
        Engine::new(config, state, dir.to_path_buf(), installer, supervisor)
    }

    fn postgres_fields() -> UnitFields {
        [
            ("host", "db1"),
            ("port", "5432"),
            ("user", "u"),
            ("password", "p"),
            ("database", "app"),
        ]
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
    }

    #[test]
    fn test_first_pass_reaches_active() {
        let dir = tempfile::tempdir().unwrap();
        let mut installer = MockInstaller::new();
        let mut supervisor = MockSupervisor::new();

        let mut engine = make_engine(
            StaticConfig::default(),
            StewardState::default(),
            dir.path(),
            &mut installer,
            &mut supervisor,
        );
        engine.submit(Event::SourceAvailable);
        engine.run().unwrap();

        assert_eq!(engine.state().phase, Phase::Active);
        assert!(engine.state().flags.service_active);
        assert!(engine.state().applied_hash.is_some());
        drop(engine);

        assert_eq!(installer.ensure_calls, 1);
        assert_eq!(supervisor.apply_calls, 1);
    }

    #[test]
    fn test_second_pass_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut installer = MockInstaller::new();
        let mut supervisor = MockSupervisor::new();

        let mut engine = make_engine(
            StaticConfig::default(),
            StewardState::default(),
            dir.path(),
            &mut installer,
            &mut supervisor,
        );
        engine.submit(Event::SourceAvailable);
        engine.run().unwrap();
        engine.submit(Event::Resync);
        engine.run().unwrap();

        assert_eq!(engine.state().phase, Phase::Active);
        drop(engine);

        assert_eq!(installer.ensure_calls, 1);
        assert_eq!(supervisor.apply_calls, 1);
    }

    #[test]
    fn test_no_source_parks_in_awaiting_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut installer = MockInstaller::new();
        let mut supervisor = MockSupervisor::new();

        let mut engine = make_engine(
            StaticConfig::default(),
            StewardState::default(),
            dir.path(),
            &mut installer,
            &mut supervisor,
        );
        engine.submit(Event::ConfigChanged);
        engine.run().unwrap();

        assert_eq!(engine.state().phase, Phase::AwaitingSource);
        drop(engine);

        assert_eq!(installer.ensure_calls, 0);
        assert_eq!(supervisor.apply_calls, 0);
    }

    #[test]
    fn test_port_change_applies_exactly_once_with_new_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut installer = MockInstaller::new();
        let mut supervisor = MockSupervisor::new();

        let mut first = make_engine(
            StaticConfig::default(),
            StewardState::default(),
            dir.path(),
            &mut installer,
            &mut supervisor,
        );
        first.submit(Event::SourceAvailable);
        first.run().unwrap();
        let h1 = first.state().applied_hash.clone().unwrap();
        let state = first.into_state();

        let changed = StaticConfig {
            port: 8080,
            ..Default::default()
        };
        let mut second = make_engine(changed, state, dir.path(), &mut installer, &mut supervisor);
        second.submit(Event::ConfigChanged);
        second.run().unwrap();

        assert_eq!(second.state().phase, Phase::Active);
        let h2 = second.state().applied_hash.clone().unwrap();
        assert_ne!(h1, h2);
        drop(second);

        assert_eq!(supervisor.apply_calls, 2);
        // Environment/unit changes never re-trigger installation
        assert_eq!(installer.ensure_calls, 1);
    }

    #[test]
    fn test_redundant_relation_notification_skips_apply() {
        let dir = tempfile::tempdir().unwrap();
        let mut installer = MockInstaller::new();
        let mut supervisor = MockSupervisor::new();

        let mut engine = make_engine(
            StaticConfig::default(),
            StewardState::default(),
            dir.path(),
            &mut installer,
            &mut supervisor,
        );
        engine.submit(Event::RelationChanged {
            kind: RelationKind::Postgres,
            unit: "postgres/0".to_string(),
            data: postgres_fields(),
        });
        engine.submit(Event::SourceAvailable);
        engine.run().unwrap();
        assert_eq!(engine.state().phase, Phase::Active);

        // Same values again: desired state is unchanged
        engine.submit(Event::RelationChanged {
            kind: RelationKind::Postgres,
            unit: "postgres/0".to_string(),
            data: postgres_fields(),
        });
        engine.run().unwrap();

        assert_eq!(engine.state().phase, Phase::Active);
        drop(engine);

        assert_eq!(supervisor.apply_calls, 1);
    }

    #[test]
    fn test_relation_conflict_degrades_until_departure() {
        let dir = tempfile::tempdir().unwrap();
        let mut installer = MockInstaller::new();
        let mut supervisor = MockSupervisor::new();

        let mut engine = make_engine(
            StaticConfig::default(),
            StewardState::default(),
            dir.path(),
            &mut installer,
            &mut supervisor,
        );
        engine.submit(Event::RelationChanged {
            kind: RelationKind::Postgres,
            unit: "postgres/0".to_string(),
            data: postgres_fields(),
        });
        engine.submit(Event::RelationChanged {
            kind: RelationKind::Mongo,
            unit: "mongo/0".to_string(),
            data: postgres_fields(),
        });
        engine.submit(Event::SourceAvailable);
        engine.run().unwrap();

        match &engine.state().phase {
            Phase::Degraded(reason) => {
                assert!(reason.contains("postgres"));
                assert!(reason.contains("mongo"));
            }
            other => panic!("expected degraded, got {other:?}"),
        }
        assert_eq!(engine.installer().ensure_calls, 0);

        engine.submit(Event::RelationDeparted {
            kind: RelationKind::Mongo,
            unit: "mongo/0".to_string(),
        });
        engine.run().unwrap();

        assert_eq!(engine.state().phase, Phase::Active);
        drop(engine);

        assert_eq!(supervisor.apply_calls, 1);
    }

    #[test]
    fn test_install_failure_degrades_then_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let mut installer = MockInstaller::new();
        installer.fail_ensure = true;
        let mut supervisor = MockSupervisor::new();

        let mut engine = make_engine(
            StaticConfig::default(),
            StewardState::default(),
            dir.path(),
            &mut installer,
            &mut supervisor,
        );
        engine.submit(Event::SourceAvailable);
        engine.run().unwrap();

        assert!(matches!(engine.state().phase, Phase::Degraded(_)));
        assert!(engine.state().applied_hash.is_none());
        let state = engine.into_state();

        installer.fail_ensure = false;
        let mut engine = engine_retry(dir.path(), state, &mut installer, &mut supervisor);
        engine.submit(Event::ConfigChanged);
        engine.run().unwrap();

        assert_eq!(engine.state().phase, Phase::Active);
        drop(engine);

        assert_eq!(installer.ensure_calls, 2);
        assert_eq!(supervisor.apply_calls, 1);
    }

    fn engine_retry<'a>(
        dir: &Path,
        state: StewardState,
        installer: &'a mut MockInstaller,
        supervisor: &'a mut MockSupervisor,
    ) -> Engine<&'a mut MockInstaller, &'a mut MockSupervisor> {
        make_engine(StaticConfig::default(), state, dir, installer, supervisor)
    }

    #[test]
    fn test_apply_failure_recovery_goes_through_install() {
        let dir = tempfile::tempdir().unwrap();
        let mut installer = MockInstaller::new();
        let mut supervisor = MockSupervisor::new();
        supervisor.fail_apply = true;

        let mut engine = make_engine(
            StaticConfig::default(),
            StewardState::default(),
            dir.path(),
            &mut installer,
            &mut supervisor,
        );
        engine.submit(Event::SourceAvailable);
        engine.run().unwrap();

        assert!(matches!(engine.state().phase, Phase::Degraded(_)));
        let state = engine.into_state();

        supervisor.fail_apply = false;
        let mut engine = engine_retry(dir.path(), state, &mut installer, &mut supervisor);
        engine.submit(Event::ConfigChanged);
        engine.run().unwrap();

        assert_eq!(engine.state().phase, Phase::Active);
        drop(engine);

        // Recovery re-enters through the idempotent install stage
        assert_eq!(installer.ensure_calls, 2);
        assert_eq!(supervisor.apply_calls, 2);
    }

    #[test]
    fn test_provision_runs_once_per_install_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut installer = MockInstaller::new();
        let mut supervisor = MockSupervisor::new();

        let config = StaticConfig {
            provision_command: Some("python3 manage.py migrate".to_string()),
            ..Default::default()
        };

        let mut engine = make_engine(
            config.clone(),
            StewardState::default(),
            dir.path(),
            &mut installer,
            &mut supervisor,
        );
        engine.submit(Event::SourceAvailable);
        engine.run().unwrap();
        engine.submit(Event::Resync);
        engine.run().unwrap();
        let state = engine.into_state();

        assert_eq!(installer.provision_calls, 1);

        // Changing the apt set starts a new installation cycle
        let changed = StaticConfig {
            apt_dependencies: "libpq-dev".to_string(),
            ..config
        };
        let mut engine = make_engine(changed, state, dir.path(), &mut installer, &mut supervisor);
        engine.submit(Event::ConfigChanged);
        engine.run().unwrap();

        assert_eq!(engine.state().phase, Phase::Active);
        drop(engine);

        assert_eq!(installer.ensure_calls, 2);
        assert_eq!(installer.provision_calls, 2);
    }

    #[test]
    fn test_relation_attach_while_active_reapplies_with_database_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut installer = MockInstaller::new();
        let mut supervisor = MockSupervisor::new();

        let mut engine = make_engine(
            StaticConfig::default(),
            StewardState::default(),
            dir.path(),
            &mut installer,
            &mut supervisor,
        );
        engine.submit(Event::SourceAvailable);
        engine.run().unwrap();
        let h1 = engine.state().applied_hash.clone().unwrap();

        engine.submit(Event::RelationJoined {
            kind: RelationKind::Postgres,
            unit: "postgres/0".to_string(),
            data: postgres_fields(),
        });
        engine.run().unwrap();

        assert_eq!(engine.state().phase, Phase::Active);
        let h2 = engine.state().applied_hash.clone().unwrap();
        assert_ne!(h1, h2);
        drop(engine);

        assert_eq!(supervisor.apply_calls, 2);
        assert_eq!(installer.ensure_calls, 1);
    }

    // ------------------------------------------------------------------
    // Transition table
    // ------------------------------------------------------------------

    fn ctx() -> ReconcileContext {
        ReconcileContext {
            source_available: true,
            deps_current: true,
            needs_provision: false,
            conflict: None,
        }
    }

    #[test]
    fn test_transition_no_source() {
        let ctx = ReconcileContext {
            source_available: false,
            ..ctx()
        };
        let t = transition(&Phase::Init, &ctx, &Event::ConfigChanged);
        assert_eq!(t.next, Phase::AwaitingSource);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_transition_conflict_wins_over_install() {
        let ctx = ReconcileContext {
            deps_current: false,
            conflict: Some("postgres, mongo".to_string()),
            ..ctx()
        };
        let t = transition(&Phase::Active, &ctx, &Event::RelationChanged {
            kind: RelationKind::Mongo,
            unit: "mongo/0".to_string(),
            data: UnitFields::new(),
        });
        assert!(matches!(t.next, Phase::Degraded(_)));
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_transition_stale_deps_install_first() {
        let ctx = ReconcileContext {
            deps_current: false,
            ..ctx()
        };
        let t = transition(&Phase::Active, &ctx, &Event::ConfigChanged);
        assert_eq!(t.next, Phase::InstallingDeps);
        assert_eq!(t.effects, vec![Effect::InstallDependencies]);
    }

    #[test]
    fn test_transition_current_deps_go_straight_to_configuring() {
        let t = transition(&Phase::Active, &ctx(), &Event::ConfigChanged);
        assert_eq!(t.next, Phase::Configuring);
        assert_eq!(t.effects, vec![Effect::CompareService]);
    }

    #[test]
    fn test_transition_deps_installed_branches_on_provisioning() {
        let t = transition(&Phase::InstallingDeps, &ctx(), &Event::DepsInstalled);
        assert_eq!(t.next, Phase::Configuring);

        let provisioning = ReconcileContext {
            needs_provision: true,
            ..ctx()
        };
        let t = transition(&Phase::InstallingDeps, &provisioning, &Event::DepsInstalled);
        assert_eq!(t.next, Phase::Provisioning);
        assert_eq!(t.effects, vec![Effect::RunProvision]);
    }

    #[test]
    fn test_transition_outcomes() {
        let t = transition(&Phase::Configuring, &ctx(), &Event::ServiceStale);
        assert_eq!(t.next, Phase::Starting);
        assert_eq!(t.effects, vec![Effect::ApplyService]);

        let t = transition(&Phase::Configuring, &ctx(), &Event::ServiceUnchanged);
        assert_eq!(t.next, Phase::Active);
        assert!(t.effects.is_empty());

        let t = transition(
            &Phase::Starting,
            &ctx(),
            &Event::ServiceApplied {
                hash: "h".to_string(),
            },
        );
        assert_eq!(t.next, Phase::Active);
        assert_eq!(t.effects, vec![Effect::PublishWebsite]);

        let t = transition(
            &Phase::Starting,
            &ctx(),
            &Event::ApplyFailed("boom".to_string()),
        );
        assert_eq!(t.next, Phase::Degraded("boom".to_string()));
    }

    #[test]
    fn test_pass_lock_blocks_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock = PassLock::acquire(dir.path()).unwrap();
        assert!(dir.path().join("pass.lock").exists());
        drop(lock);
        assert!(!dir.path().join("pass.lock").exists());
    }
}
