//! Risk classification for pending tool calls.
//!
//! The evaluator is a pure function from `(tool name, args, settings)` to a
//! [`RiskAssessment`]. It never executes anything; the scheduler uses the
//! result to decide whether a call goes straight to the queue or must pass
//! the confirmation gate first.

use crate::config::AgentSettings;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::OnceLock;

/// Classification from safe to critical, gating confirmation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "safe" => Some(Self::Safe),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Result of classifying one pending call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub reasons: Vec<String>,
    pub requires_confirmation: bool,
}

impl RiskAssessment {
    fn new(level: RiskLevel, reasons: Vec<String>, settings: &AgentSettings) -> Self {
        let threshold = RiskLevel::parse(&settings.get_str("risk.threshold", "medium"))
            .unwrap_or(RiskLevel::Medium);
        let requires_confirmation = level >= threshold && !settings.allows_dangerous();
        Self {
            level,
            reasons,
            requires_confirmation,
        }
    }
}

/// The first significant SQL keyword, after stripping comments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Show,
    Explain,
    Insert,
    Create,
    Update,
    Delete,
    Drop,
    Truncate,
    Alter,
    Other,
}

impl StatementKind {
    /// Whether this statement mutates data or schema. Used by read-only
    /// adapters to reject execution.
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        !matches!(self, Self::Select | Self::Show | Self::Explain)
    }
}

/// Classify a SQL string by its first significant token.
#[must_use]
pub fn classify_statement(sql: &str) -> StatementKind {
    let stripped = strip_leading_comments(sql);
    let first = stripped
        .split_whitespace()
        .next()
        .map(str::to_ascii_uppercase)
        .unwrap_or_default();
    match first.as_str() {
        "SELECT" | "WITH" => StatementKind::Select,
        "SHOW" | "DESCRIBE" | "DESC" | "PRAGMA" => StatementKind::Show,
        "EXPLAIN" => StatementKind::Explain,
        "INSERT" => StatementKind::Insert,
        "CREATE" => StatementKind::Create,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        "DROP" => StatementKind::Drop,
        "TRUNCATE" => StatementKind::Truncate,
        "ALTER" => StatementKind::Alter,
        _ => StatementKind::Other,
    }
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail).trim_start();
        } else {
            return rest;
        }
    }
}

fn has_where_clause(sql: &str) -> bool {
    static WHERE_RE: OnceLock<Regex> = OnceLock::new();
    WHERE_RE
        .get_or_init(|| Regex::new(r"(?i)\bWHERE\b").expect("static regex"))
        .is_match(sql)
}

/// System-catalog targets escalate destructive DDL to critical.
fn targets_system_catalog(sql: &str) -> bool {
    static CATALOG_RE: OnceLock<Regex> = OnceLock::new();
    CATALOG_RE
        .get_or_init(|| {
            Regex::new(r"(?i)\b(pg_catalog|information_schema|sqlite_master|mysql)\s*\.")
                .expect("static regex")
        })
        .is_match(sql)
}

/// Default shell deny list; any match is critical.
fn shell_denied(command: &str) -> bool {
    static DENY_RES: OnceLock<Vec<Regex>> = OnceLock::new();
    DENY_RES
        .get_or_init(|| {
            [
                r"rm\s+-rf\s+/",
                r"rm\s+-r\s+-f\s+/",
                r"rm\s+-f\s+-r\s+/",
                r"^sudo\s",
                r"chmod\s+777",
                r"mkfs\.",
                r"dd\s+if=",
                r">\s*/dev/",
            ]
            .iter()
            .map(|p| Regex::new(p).expect("static regex"))
            .collect()
        })
        .iter()
        .any(|re| re.is_match(command))
}

fn shell_allowed(command: &str, settings: &AgentSettings) -> bool {
    let allow_list = settings
        .get("risk.shell_whitelist")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if allow_list.is_empty() {
        // No whitelist configured: everything not denied is merely low risk.
        return true;
    }
    allow_list.iter().filter_map(Value::as_str).any(|pattern| {
        Regex::new(pattern)
            .map(|re| re.is_match(command))
            .unwrap_or(false)
    })
}

/// Classify one pending tool call. Pure; no I/O.
#[must_use]
pub fn evaluate(tool_name: &str, args: &Value, settings: &AgentSettings) -> RiskAssessment {
    match tool_name {
        "sql_execute" | "database_export" => {
            let sql = args.get("sql").and_then(Value::as_str).unwrap_or("");
            evaluate_sql(sql, settings)
        }
        "shell_execute" => {
            let command = args.get("command").and_then(Value::as_str).unwrap_or("");
            evaluate_shell(command, settings)
        }
        "code_execute" => RiskAssessment::new(
            RiskLevel::Medium,
            vec!["arbitrary code execution".into()],
            settings,
        ),
        "file_write" => {
            let path = args.get("path").and_then(Value::as_str).unwrap_or("");
            evaluate_file_write(path, settings)
        }
        // Discovery and read-only tools.
        "schema_discovery" | "table_details" | "file_read" | "web_fetch"
        | "database_connect" => RiskAssessment::new(RiskLevel::Safe, Vec::new(), settings),
        _ => RiskAssessment::new(
            RiskLevel::Low,
            vec![format!("unrecognized tool '{tool_name}'")],
            settings,
        ),
    }
}

/// Classify a SQL statement on its own. Also used by adapters to enforce
/// read-only connections.
#[must_use]
pub fn evaluate_sql(sql: &str, settings: &AgentSettings) -> RiskAssessment {
    let kind = classify_statement(sql);
    let mut reasons = Vec::new();

    let level = match kind {
        StatementKind::Select | StatementKind::Show | StatementKind::Explain => RiskLevel::Safe,
        StatementKind::Insert | StatementKind::Create => {
            reasons.push("non-destructive write".into());
            RiskLevel::Low
        }
        StatementKind::Update | StatementKind::Delete => {
            if has_where_clause(sql) {
                reasons.push("row mutation with WHERE clause".into());
                RiskLevel::Medium
            } else {
                reasons.push("mutation without WHERE clause affects all rows".into());
                RiskLevel::High
            }
        }
        StatementKind::Drop | StatementKind::Truncate | StatementKind::Alter => {
            if targets_system_catalog(sql) {
                reasons.push("destructive DDL against the system catalog".into());
                return RiskAssessment::new(RiskLevel::Critical, reasons, settings);
            }
            reasons.push("destructive schema operation".into());
            RiskLevel::High
        }
        StatementKind::Other => {
            reasons.push("unclassified statement".into());
            RiskLevel::Medium
        }
    };

    RiskAssessment::new(level, reasons, settings)
}

fn evaluate_shell(command: &str, settings: &AgentSettings) -> RiskAssessment {
    if shell_denied(command) {
        return RiskAssessment::new(
            RiskLevel::Critical,
            vec!["command matches the deny list".into()],
            settings,
        );
    }
    if !shell_allowed(command, settings) {
        return RiskAssessment::new(
            RiskLevel::High,
            vec!["command outside the configured whitelist".into()],
            settings,
        );
    }
    RiskAssessment::new(RiskLevel::Low, Vec::new(), settings)
}

fn evaluate_file_write(path: &str, settings: &AgentSettings) -> RiskAssessment {
    let target = Path::new(path);
    let inside_workspace = if target.is_absolute() {
        target.starts_with(settings.workspace_root())
    } else {
        // Relative paths resolve under the workspace root unless they escape it.
        !path.split('/').any(|seg| seg == "..")
    };
    if inside_workspace {
        RiskAssessment::new(RiskLevel::Low, vec!["file write".into()], settings)
    } else {
        RiskAssessment::new(
            RiskLevel::High,
            vec!["write outside the workspace root".into()],
            settings,
        )
    }
}
