use crate::context::AppContext;
use crate::passes::run_status_pass;
use anyhow::Result;
use chrono::Utc;
use log::info;

pub async fn run(app: &AppContext) -> Result<()> {
    info!("Received status command");
    run_status_pass(app, Utc::now()).await;
    Ok(())
}
