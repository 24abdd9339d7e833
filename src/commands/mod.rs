//! Subcommand entry points
//!
//! Each command is a thin wrapper: load config and state, acquire the
//! pass lock, hand the event to the engine, report the outcome.

use anyhow::Result;
use std::fs;

use crate::Context;
use crate::config::StaticConfig;
use crate::engine::{Engine, Event, PassLock, Phase};
use crate::install::SystemInstaller;
use crate::paths;
use crate::service::SystemdSupervisor;
use crate::state::StewardState;
use crate::ui;

pub mod event;
pub mod reconcile;
pub mod reset;
pub mod status;
pub mod stop;

/// Run one reconciliation pass for a single delivered event.
fn run_pass(ctx: &Context, event: Event) -> Result<()> {
    let config = StaticConfig::load()?;
    let state_dir = paths::state_dir()?;
    fs::create_dir_all(&state_dir)?;

    let _lock = PassLock::acquire(&state_dir)?;
    let state = StewardState::load(&state_dir)?;

    let installer = SystemInstaller::new(state_dir.clone());
    let supervisor = SystemdSupervisor::new();

    let mut engine = Engine::new(config, state, state_dir, installer, supervisor);
    engine.submit(event);
    engine.run()?;

    if !ctx.quiet {
        match &engine.state().phase {
            Phase::Active => ui::success(&format!("Phase: {}", engine.state().phase)),
            Phase::Degraded(_) => ui::error(&format!("Phase: {}", engine.state().phase)),
            phase => ui::info(&format!("Phase: {phase}")),
        }
        if ctx.verbose > 0
            && let Some(hash) = &engine.state().applied_hash
        {
            ui::kv("applied hash", hash);
        }
    }
    Ok(())
}
