//! Schema-drift hint detection (§4.5 step 11): compares identifiers a
//! query references against the schema context the agent believed to
//! exist, without itself deciding whether to refresh (that decision is
//! `AGENT_SCHEMA_DRIFT_AUTO_REFRESH`, carried on `AgentState`).

use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct DriftReport {
    pub suspected: bool,
    pub missing_identifiers: Vec<String>,
}

/// Raw schema context rows as retrieved pre-execution: a flat set of known
/// table/column identifiers (already case-folded by the caller).
pub fn detect_drift(referenced_identifiers: &[String], known_identifiers: &HashSet<String>) -> DriftReport {
    let missing: Vec<String> = referenced_identifiers
        .iter()
        .filter(|id| !known_identifiers.contains(id.as_str()))
        .cloned()
        .collect();

    DriftReport {
        suspected: !missing.is_empty(),
        missing_identifiers: missing,
    }
}

/// Advisory pre-execution check (§4.5 step 4): referenced tables missing
/// from the raw schema context attach a hint but never block dispatch.
pub fn pre_execution_missing_tables(referenced_tables: &[String], known_tables: &HashSet<String>) -> Vec<String> {
    referenced_tables
        .iter()
        .filter(|t| !known_tables.contains(t.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_missing_identifier() {
        let known: HashSet<String> = ["orders".to_string(), "orders.id".to_string()].into_iter().collect();
        let report = detect_drift(&["orders.id".to_string(), "orders.legacy_col".to_string()], &known);
        assert!(report.suspected);
        assert_eq!(report.missing_identifiers, vec!["orders.legacy_col".to_string()]);
    }

    #[test]
    fn no_drift_when_all_identifiers_known() {
        let known: HashSet<String> = ["orders".to_string()].into_iter().collect();
        let report = detect_drift(&["orders".to_string()], &known);
        assert!(!report.suspected);
    }

    #[test]
    fn pre_execution_check_is_advisory_list_only() {
        let known: HashSet<String> = ["orders".to_string()].into_iter().collect();
        let missing = pre_execution_missing_tables(&["orders".to_string(), "ghost_table".to_string()], &known);
        assert_eq!(missing, vec!["ghost_table".to_string()]);
    }
}
