//! `steward event` - deliver an input-change notification

use anyhow::{Context as _, Result, bail};
use serde_json::Value;

use crate::Context;
use crate::cli::EventCommand;
use crate::engine::Event;
use crate::relation::UnitFields;

pub fn run(ctx: &Context, command: EventCommand) -> Result<()> {
    let event = match command {
        EventCommand::ConfigChanged => Event::ConfigChanged,
        EventCommand::SourceAvailable => Event::SourceAvailable,
        EventCommand::RelationJoined { kind, unit, data } => Event::RelationJoined {
            kind: kind.into(),
            unit,
            data: parse_pairs(&data)?,
        },
        EventCommand::RelationChanged {
            kind,
            unit,
            data,
            json,
        } => {
            let mut fields = parse_pairs(&data)?;
            if let Some(blob) = json {
                fields.extend(parse_json(&blob)?);
            }
            Event::RelationChanged {
                kind: kind.into(),
                unit,
                data: fields,
            }
        }
        EventCommand::RelationDeparted { kind, unit } => Event::RelationDeparted {
            kind: kind.into(),
            unit,
        },
    };

    super::run_pass(ctx, event)
}

/// Parse repeated `KEY=VALUE` arguments into a field map
fn parse_pairs(pairs: &[String]) -> Result<UnitFields> {
    let mut fields = UnitFields::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid field declaration (expected KEY=VALUE): {pair}");
        };
        fields.insert(key.to_string(), value.to_string());
    }
    Ok(fields)
}

/// Parse a JSON object into a field map, stringifying scalar values
fn parse_json(blob: &str) -> Result<UnitFields> {
    let value: Value = serde_json::from_str(blob).context("Invalid JSON field data")?;
    let Value::Object(map) = value else {
        bail!("JSON field data must be an object");
    };

    let mut fields = UnitFields::new();
    for (key, value) in map {
        let rendered = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => continue,
            other => bail!("field {key} has non-scalar value: {other}"),
        };
        fields.insert(key, rendered);
    }
    Ok(fields)
}

// ============================================================================
// Tests
// ============================================================================
