//! `storaged objects` and `storaged resync` — published object visibility.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use tabled::{settings::Style, Table, Tabled};

use storaged_daemon::{request_objects, request_resync};
use storaged_sync::{EntityKind, UpstreamEntity};

use crate::Session;

/// Arguments for `storaged objects`.
#[derive(Args, Debug)]
pub struct ObjectsArgs {
    /// Only show objects of this kind (block, drive, md_raid, ...).
    #[arg(long)]
    pub kind: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Deserialize)]
struct ObjectRow {
    path: String,
    entity: UpstreamEntity,
    published_at: DateTime<Utc>,
}

#[derive(Tabled)]
struct ObjectTableRow {
    #[tabled(rename = "path")]
    path: String,
    #[tabled(rename = "detail")]
    detail: String,
    #[tabled(rename = "origin")]
    origin: String,
    #[tabled(rename = "published")]
    published: String,
}

impl ObjectsArgs {
    pub fn run(self, ctx: &Session) -> Result<()> {
        let raw = request_objects(ctx.socket()).context("failed to list objects")?;
        let mut objects: Vec<ObjectRow> =
            serde_json::from_value(raw).context("daemon sent a malformed object list")?;
        if let Some(kind) = self.kind.as_deref() {
            objects.retain(|o| kind_key(&o.entity.kind) == kind);
        }

        if self.json {
            let payload: Vec<_> = objects
                .iter()
                .map(|o| {
                    serde_json::json!({
                        "path": o.path,
                        "kind": kind_key(&o.entity.kind),
                        "detail": kind_detail(&o.entity.kind),
                        "published_at": o.published_at.to_rfc3339(),
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize object JSON")?
            );
            return Ok(());
        }

        print_table(objects);
        Ok(())
    }
}

pub fn resync(ctx: &Session) -> Result<()> {
    let report = request_resync(ctx.socket()).context("resync failed")?;
    let count = |field: &str| report[field].as_array().map_or(0, Vec::len);
    println!(
        "{} added, {} removed, {} refreshed",
        count("added").to_string().green(),
        count("removed").to_string().red(),
        report["refreshed"].as_u64().unwrap_or(0),
    );
    Ok(())
}

fn print_table(objects: Vec<ObjectRow>) {
    println!("storaged v{} | {} objects", env!("CARGO_PKG_VERSION"), objects.len());
    if objects.is_empty() {
        println!("No objects published.");
        return;
    }

    let separator = "■".repeat(67).bright_black().to_string();
    let mut grouped = BTreeMap::<&'static str, Vec<ObjectRow>>::new();
    for object in objects {
        grouped
            .entry(kind_key(&object.entity.kind))
            .or_default()
            .push(object);
    }

    println!("{separator}");
    for (kind, rows) in grouped {
        println!("{}", kind.to_uppercase().bold());
        let table_rows: Vec<ObjectTableRow> = rows
            .into_iter()
            .map(|row| ObjectTableRow {
                path: row.path,
                detail: kind_detail(&row.entity.kind),
                origin: row.entity.key.origin,
                published: format_age(row.published_at, Utc::now()),
            })
            .collect();
        let mut table = Table::new(table_rows);
        table.with(Style::rounded());
        println!("{table}");
        println!("{separator}");
    }
}

fn kind_key(kind: &EntityKind) -> &'static str {
    match kind {
        EntityKind::Block { .. } => "block",
        EntityKind::Drive { .. } => "drive",
        EntityKind::MdRaid { .. } => "md_raid",
        EntityKind::VolumeGroup { .. } => "volume_group",
        EntityKind::LogicalVolume { .. } => "logical_volume",
        EntityKind::Job { .. } => "job",
    }
}

fn kind_detail(kind: &EntityKind) -> String {
    match kind {
        EntityKind::Block { device, size } => format!("{device} ({})", format_size(*size)),
        EntityKind::Drive {
            vendor,
            model,
            serial,
            ..
        } => [vendor.as_str(), model.as_str(), serial.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        EntityKind::MdRaid { uuid, name } if name.is_empty() => uuid.clone(),
        EntityKind::MdRaid { name, .. } => name.clone(),
        EntityKind::VolumeGroup { name } => name.clone(),
        EntityKind::LogicalVolume { volume_group, name } => format!("{volume_group}/{name}"),
        EntityKind::Job { operation } => operation.clone(),
    }
}

/// Human-readable size with binary units.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// "just now", "5m ago", "3h ago", "2d ago".
pub fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds().max(0);
    match secs {
        0..=59 => "just now".to_string(),
        60..=3_599 => format!("{}m ago", secs / 60),
        3_600..=86_399 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
