use runway_engine::{FixOutcome, OpsClient, Resolution};

use super::Out;
use crate::render;
use crate::OutputFormat;

pub(crate) async fn fix(
    ops: &OpsClient,
    change_id: &str,
    resolution: Resolution,
    out: Out,
) -> Result<(), String> {
    let outcome = ops
        .fix_issue(change_id, resolution)
        .await
        .map_err(|e| e.to_string())?;

    let entry = match &outcome {
        FixOutcome::Recorded { entry } => entry,
        FixOutcome::NoIssueFound { change_id } => {
            return Err(format!(
                "NO_ISSUE_FOUND: change '{}' has no open issue",
                change_id
            ));
        }
    };
    match out.format {
        OutputFormat::Json => out.json(&outcome),
        OutputFormat::Text => {
            out.note(&format!(
                "{} marked {} at {} (execution {})",
                entry.change_id,
                entry.state,
                render::timestamp(entry.created_at),
                entry.execution_id
            ));
            Ok(())
        }
    }
}
