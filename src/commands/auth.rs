use crate::context::AppContext;
use crate::passes::run_auth_pass;
use anyhow::{anyhow, Result};
use chrono::Utc;
use log::info;

/// Refreshes the broker session. Fails the process when the session could
/// not be refreshed so the scheduler can surface it.
pub async fn run(app: &AppContext) -> Result<()> {
    info!("Received auth command");
    let report = run_auth_pass(app, Utc::now()).await;
    match report.aborted {
        Some(reason) => Err(anyhow!("Broker authentication failed: {}", reason)),
        None => Ok(()),
    }
}
