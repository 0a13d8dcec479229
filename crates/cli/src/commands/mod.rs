mod fix;
mod history;
mod issues;

pub(crate) use fix::fix;
pub(crate) use history::{history, snapshot};
pub(crate) use issues::{issue, issues};

use serde::Serialize;

use crate::OutputFormat;

/// Where and how a command prints its result.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Out {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl Out {
    fn json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), String> {
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| format!("serialization error: {}", e))?;
        println!("{}", text);
        Ok(())
    }

    /// Trailing summary lines; dropped with `--quiet`.
    fn note(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }
}
