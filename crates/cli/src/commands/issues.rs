use runway_engine::OpsClient;

use super::Out;
use crate::render;
use crate::OutputFormat;

pub(crate) async fn issues(ops: &OpsClient, out: Out) -> Result<(), String> {
    let issues = ops.issues().await.map_err(|e| e.to_string())?;
    match out.format {
        OutputFormat::Json => out.json(&issues),
        OutputFormat::Text => {
            if issues.is_empty() {
                out.note("no open issues");
                return Ok(());
            }
            print!("{}", render::issue_list(&issues));
            out.note(&format!(
                "{} open issue(s); inspect with `runway issue <change-id>`",
                issues.len()
            ));
            Ok(())
        }
    }
}

pub(crate) async fn issue(ops: &OpsClient, change_id: &str, out: Out) -> Result<(), String> {
    let issue = ops
        .issue_by_change_id(change_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no open issue for change '{}'", change_id))?;
    match out.format {
        OutputFormat::Json => out.json(&issue),
        OutputFormat::Text => {
            print!("{}", render::issue_detail(&issue));
            Ok(())
        }
    }
}
