//! `steward stop` - stop the managed service

use anyhow::Result;

use crate::Context;
use crate::config::StaticConfig;
use crate::service::{Supervisor, SystemdSupervisor};
use crate::ui;

pub fn run(ctx: &Context) -> Result<()> {
    let config = StaticConfig::load()?;
    let mut supervisor = SystemdSupervisor::new();

    if !supervisor.is_running(&config.service_name) {
        if !ctx.quiet {
            ui::info(&format!("{} is not running", config.service_name));
        }
        return Ok(());
    }

    supervisor.stop(&config.service_name)?;
    if !ctx.quiet {
        ui::success(&format!("Stopped {}", config.service_name));
    }
    Ok(())
}
