use anyhow::Context;
use simulation::export::export_json;
use simulation::scenario::{run_scenario, ScenarioConfig};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let seed = match std::env::args().nth(1) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("seed must be an unsigned integer, got {:?}", raw))?,
        None => ScenarioConfig::default().seed,
    };

    tracing::info!(seed, "Starting venue simulation");

    let report = run_scenario(ScenarioConfig {
        seed,
        ..ScenarioConfig::default()
    })
    .await?;

    println!("{}", export_json(&report)?);

    if !report.is_leak_free() {
        anyhow::bail!(
            "teardown leaked {} feeds and {} handles",
            report.feeds_open_after_teardown,
            report.handles_tracked_after_teardown
        );
    }
    Ok(())
}
