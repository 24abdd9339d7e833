//! `steward reset` - explicit lifecycle flag reset

use anyhow::Result;
use std::fs;

use crate::Context;
use crate::engine::PassLock;
use crate::paths;
use crate::state::StewardState;
use crate::ui;

pub fn run(ctx: &Context) -> Result<()> {
    let state_dir = paths::state_dir()?;
    fs::create_dir_all(&state_dir)?;

    let _lock = PassLock::acquire(&state_dir)?;
    let mut state = StewardState::load(&state_dir)?;
    state.reset();
    state.save(&state_dir)?;

    if !ctx.quiet {
        ui::success("Lifecycle flags cleared; phase reset to init");
    }
    Ok(())
}
