use crate::context::AppContext;
use crate::models::StrategyKind;
use crate::passes::run_exit_pass;
use anyhow::Result;
use chrono::Utc;
use log::info;

pub async fn run(app: &AppContext, kind: StrategyKind) -> Result<()> {
    info!("Received sell command for {} positions", kind);
    let report = run_exit_pass(app, kind, Utc::now()).await;
    for position in &report.sold {
        if let Some(exit) = &position.exit {
            info!(
                "Sold {} x{} @ {:.2}: {} (P&L {:.2})",
                position.symbol, position.quantity, exit.price, exit.reason, exit.realized_pnl
            );
        }
    }
    for item in &report.skipped {
        info!("Left {} for the next cycle: {}", item.symbol, item.reason);
    }
    Ok(())
}
