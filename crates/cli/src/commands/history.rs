use runway_engine::OpsClient;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::Out;
use crate::render;
use crate::OutputFormat;

pub(crate) async fn history(ops: &OpsClient, change: Option<&str>, out: Out) -> Result<(), String> {
    let entries = match change {
        Some(id) => ops.change_history(id).await,
        None => ops.history().await,
    }
    .map_err(|e| e.to_string())?;

    match out.format {
        OutputFormat::Json => out.json(&entries),
        OutputFormat::Text => {
            if entries.is_empty() {
                out.note("no audit entries");
                return Ok(());
            }
            print!("{}", render::entry_table(&entries));
            out.note(&format!("{} entr(ies)", entries.len()));
            Ok(())
        }
    }
}

pub(crate) async fn snapshot(ops: &OpsClient, since: Option<&str>, out: Out) -> Result<(), String> {
    let entries = match since {
        Some(raw) => {
            let since = OffsetDateTime::parse(raw, &Rfc3339)
                .map_err(|e| format!("invalid --since timestamp '{}': {}", raw, e))?;
            ops.snapshot_since(since).await
        }
        None => ops.snapshot().await,
    }
    .map_err(|e| e.to_string())?;

    match out.format {
        OutputFormat::Json => out.json(&entries),
        OutputFormat::Text => {
            if entries.is_empty() {
                out.note("no changes recorded");
                return Ok(());
            }
            print!("{}", render::entry_table(&entries));
            let applied = entries.iter().filter(|e| e.state.is_applied()).count();
            out.note(&format!("{} change(s), {} applied", entries.len(), applied));
            Ok(())
        }
    }
}
