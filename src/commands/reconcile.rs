//! `steward reconcile` - re-evaluate against current inputs

use anyhow::Result;

use crate::Context;
use crate::engine::Event;

pub fn run(ctx: &Context) -> Result<()> {
    super::run_pass(ctx, Event::Resync)
}
