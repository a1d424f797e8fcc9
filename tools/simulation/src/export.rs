//! Report export
//!
//! Serializes scenario reports to JSON for external consumption.

use crate::scenario::ScenarioReport;

/// Export a report as pretty-printed JSON.
pub fn export_json(report: &ScenarioReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}

/// Write a report to a file path.
pub fn write_to_file(report: &ScenarioReport, path: &str) -> std::io::Result<()> {
    let json = export_json(report)?;
    std::fs::write(path, json)
}
