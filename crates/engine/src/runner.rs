use std::fmt;

use uuid::Uuid;

/// Identity of one engine process, used as the lock owner and reported in
/// the run summary. Audit entries carry the change's own author instead.
///
/// Format: `<service>@<host>#<uuid>`, with characters outside
/// `[A-Za-z0-9._-]` in the first two parts replaced by `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerId(String);

impl RunnerId {
    pub fn generate(service_identifier: Option<&str>) -> Self {
        let host = hostname();
        let service = service_identifier
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(host.as_str());
        RunnerId(format!(
            "{}@{}#{}",
            sanitize(service),
            sanitize(&host),
            Uuid::new_v4()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fresh id grouping every audit entry of one run attempt.
pub fn new_execution_id() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn hostname() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_id_has_service_host_and_uuid() {
        let id = RunnerId::generate(Some("billing svc"));
        let (service, rest) = id.as_str().split_once('@').unwrap();
        let (host, uuid) = rest.split_once('#').unwrap();
        assert_eq!(service, "billing_svc");
        assert!(!host.is_empty());
        assert!(Uuid::parse_str(uuid).is_ok());
    }

    #[test]
    fn runner_ids_are_unique_per_process_start() {
        assert_ne!(RunnerId::generate(Some("a")), RunnerId::generate(Some("a")));
    }

    #[test]
    fn blank_service_falls_back_to_host() {
        let id = RunnerId::generate(Some("  "));
        let (service, rest) = id.as_str().split_once('@').unwrap();
        let (host, _) = rest.split_once('#').unwrap();
        assert_eq!(service, host);
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize("a/b:c d.e-f_g"), "a_b_c_d.e-f_g");
    }
}
