//! Plain-text rendering of ledger records.

use runway_storage::{AuditEntry, AuditEntryIssue};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const HEADERS: [&str; 7] = [
    "CREATED_AT",
    "CHANGE",
    "STATE",
    "STAGE",
    "TX_TYPE",
    "TARGET",
    "AUTHOR",
];

pub(crate) fn timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

fn row(entry: &AuditEntry) -> [String; 7] {
    [
        timestamp(entry.created_at),
        entry.change_id.clone(),
        entry.state.to_string(),
        entry.stage_id.clone(),
        entry.tx_type.to_string(),
        entry.target_system_id.clone(),
        entry.author.clone(),
    ]
}

/// Entries as an aligned table, one line per entry.
pub(crate) fn entry_table(entries: &[AuditEntry]) -> String {
    let rows: Vec<[String; 7]> = entries.iter().map(row).collect();
    let mut widths = HEADERS.map(str::len);
    for r in &rows {
        for (w, cell) in widths.iter_mut().zip(r) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = String::new();
    let header = HEADERS.map(String::from);
    for r in std::iter::once(&header).chain(&rows) {
        let line: Vec<String> = r
            .iter()
            .zip(widths)
            .map(|(cell, w)| format!("{cell:<w$}"))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    }
    out
}

/// One line per issue.
pub(crate) fn issue_list(issues: &[AuditEntryIssue]) -> String {
    let mut out = String::new();
    for issue in issues {
        let e = &issue.entry;
        out.push_str(&format!(
            "{}  {}  stage={} target={} since {}\n",
            e.change_id,
            e.state,
            e.stage_id,
            e.target_system_id,
            timestamp(e.created_at)
        ));
        if let Some(first) = issue.error_trace().and_then(|t| t.lines().next()) {
            out.push_str(&format!("    {first}\n"));
        }
    }
    out
}

pub(crate) fn issue_detail(issue: &AuditEntryIssue) -> String {
    let e = &issue.entry;
    let mut out = format!(
        "Change:     {}\nState:      {}\nStage:      {}\nTarget:     {}\nTx type:    {}\nRecovery:   {}\nClass:      {}.{}\nAuthor:     {}\nExecution:  {} on {}\n",
        e.change_id,
        e.state,
        e.stage_id,
        e.target_system_id,
        e.tx_type,
        e.recovery_strategy,
        e.class_name,
        e.method_name,
        e.author,
        e.execution_id,
        e.execution_hostname,
    );
    if let Some(trace) = issue.error_trace() {
        out.push_str("\nError:\n");
        for line in trace.lines() {
            out.push_str(&format!("  {line}\n"));
        }
    }
    out.push_str("\nHistory:\n");
    out.push_str(&entry_table(&issue.history));
    out.push_str(&format!(
        "\nResolve with: runway fix {} --resolution applied|rolled-back\n",
        e.change_id
    ));
    out
}
