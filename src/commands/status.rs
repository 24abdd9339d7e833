//! `steward status` - show the engine's current view of the world

use anyhow::Result;

use crate::Context;
use crate::config::StaticConfig;
use crate::engine::Phase;
use crate::paths;
use crate::relation::{self, RelationDescriptor, RelationKind};
use crate::state::StewardState;
use crate::ui;

pub fn run(_ctx: &Context) -> Result<()> {
    let config = StaticConfig::load()?;
    let state_dir = paths::state_dir()?;
    let state = StewardState::load(&state_dir)?;

    ui::header("Service");
    ui::kv("name", &config.service_name);
    ui::kv("port", &config.port.to_string());
    ui::kv("module", &config.wsgi_module);
    ui::kv("root", &config.application_root);

    ui::header("Engine");
    match &state.phase {
        Phase::Active => ui::success(&format!("Phase: {}", state.phase)),
        Phase::Degraded(_) => ui::error(&format!("Phase: {}", state.phase)),
        phase => ui::info(&format!("Phase: {phase}")),
    }
    ui::flag("source available", state.flags.source_available);
    ui::flag("dependencies installed", state.flags.dependencies_installed);
    ui::flag("service configured", state.flags.service_configured);
    ui::flag("service active", state.flags.service_active);

    ui::header("Applied state");
    ui::kv(
        "hash",
        state.applied_hash.as_deref().unwrap_or("(never applied)"),
    );
    ui::kv(
        "deps fingerprint",
        state.deps_fingerprint.as_deref().unwrap_or("(none)"),
    );
    ui::kv("updated", &state.last_updated.to_rfc3339());

    ui::header("Relations");
    for kind in [RelationKind::Postgres, RelationKind::Mongo] {
        ui::kv(
            kind.name(),
            &format!("{} unit(s) attached", state.relations.unit_count(kind)),
        );
    }
    match relation::resolve(&state.relations) {
        Ok(RelationDescriptor::None) => ui::kv("database", "none ready"),
        Ok(descriptor) => {
            if let Some(url) = descriptor.database_url() {
                ui::kv("database", &url);
            }
        }
        Err(e) => ui::warn(&e.to_string()),
    }

    Ok(())
}
