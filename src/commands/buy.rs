use crate::context::AppContext;
use crate::models::StrategyKind;
use crate::passes::run_entry_pass;
use anyhow::Result;
use chrono::Utc;
use log::info;

pub async fn run(app: &AppContext, kind: StrategyKind) -> Result<()> {
    info!("Received buy command for {} positions", kind);
    let report = run_entry_pass(app, kind, Utc::now()).await;
    for position in &report.bought {
        info!(
            "Bought {} x{} @ {:.2} (stop {:.2}, target {:.2})",
            position.symbol, position.quantity, position.buy_price, position.stop_loss, position.target
        );
    }
    Ok(())
}
