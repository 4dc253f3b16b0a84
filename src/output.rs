/*!
 * CLI tables
 */

use chrono::{DateTime, Utc};
use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use dpf_core_selector::model::TypeTag;
use dpf_core_selector::{DataPlaneInstance, TransferRecord, TransferState};
use std::collections::BTreeSet;

/// Create a styled data table
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Create a minimal table (no outer borders)
pub fn create_minimal_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_NO_BORDERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn header(titles: &[&str]) -> Vec<Cell> {
    titles
        .iter()
        .map(|title| {
            Cell::new(title)
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold)
        })
        .collect()
}

fn tags(set: &BTreeSet<TypeTag>) -> String {
    set.iter()
        .map(TypeTag::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds();
    if secs < 0 {
        "in future".to_string()
    } else {
        format!("{}s ago", secs)
    }
}

/// Registered instances with liveness
pub fn instances_table(instances: &[(DataPlaneInstance, bool)], now: DateTime<Utc>) -> Table {
    let mut table = create_table();
    table.set_header(header(&[
        "Instance",
        "URL",
        "Sources",
        "Destinations",
        "Transfer types",
        "Live",
        "Heartbeat",
        "Selected",
    ]));

    for (instance, live) in instances {
        let live_cell = if *live {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::Red)
        };
        table.add_row(vec![
            Cell::new(instance.id.as_str()).add_attribute(Attribute::Bold),
            Cell::new(instance.url.as_deref().unwrap_or("-")).fg(Color::DarkGrey),
            Cell::new(tags(&instance.source_types)),
            Cell::new(tags(&instance.destination_types)),
            Cell::new(tags(&instance.transfer_types)),
            live_cell,
            Cell::new(age(now, instance.last_heartbeat)),
            Cell::new(instance.turn_count),
        ]);
    }

    table
}

fn state_cell(state: TransferState) -> Cell {
    let color = match state {
        TransferState::Completed => Color::Green,
        TransferState::Failed => Color::Red,
        TransferState::Cancelled => Color::Yellow,
        _ => Color::White,
    };
    Cell::new(state).fg(color)
}

/// Transfer records, one row each
pub fn records_table(records: &[TransferRecord]) -> Table {
    let mut table = create_table();
    table.set_header(header(&[
        "Transfer", "Route", "Instance", "State", "Attempts", "Last error",
    ]));

    for record in records {
        table.add_row(vec![
            Cell::new(record.id),
            Cell::new(record.request.key()),
            Cell::new(
                record
                    .instance_id
                    .as_ref()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            state_cell(record.state),
            Cell::new(record.attempt_count + 1),
            Cell::new(record.last_error.as_deref().unwrap_or("")).fg(Color::DarkGrey),
        ]);
    }

    table
}

/// Key-value summary
pub fn stats_table(items: &[(&str, String)]) -> Table {
    let mut table = create_minimal_table();

    for (key, value) in items {
        table.add_row(vec![
            Cell::new(key).fg(Color::Cyan),
            Cell::new(value)
                .fg(Color::White)
                .add_attribute(Attribute::Bold),
        ]);
    }

    table
}
