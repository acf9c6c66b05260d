use crate::bar_utils::sanitize_bars;
use crate::context::AppContext;
use crate::entry::{EntryContext, EntryDecision, EntryEvaluator};
use crate::error::{LedgerError, TradingError};
use crate::exit::{ExitContext, ExitDecision, ExitEvaluator};
use crate::indicators::IndicatorSnapshot;
use crate::models::{OrderSide, OrderType, Position, ScanCandidate, StrategyKind};
use crate::notifications;
use crate::providers::{notify, OrderRequest};
use crate::strategy::StrategyProfile;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use log::{error, info, warn};
use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Entry,
    Exit,
    Status,
    Auth,
}

impl PassKind {
    pub fn label(&self) -> &'static str {
        match self {
            PassKind::Entry => "Buy",
            PassKind::Exit => "Sell",
            PassKind::Status => "Status",
            PassKind::Auth => "Auth",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedItem {
    pub symbol: String,
    pub reason: String,
}

/// What one pass did. A pass never fails; problems end up in `skipped` or
/// `aborted`.
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub pass: PassKind,
    pub kind: Option<StrategyKind>,
    pub started_at: DateTime<Utc>,
    pub bought: Vec<Position>,
    pub sold: Vec<Position>,
    pub extended: Vec<String>,
    pub trailing_raised: Vec<String>,
    pub held: usize,
    pub skipped: Vec<SkippedItem>,
    pub aborted: Option<String>,
}

impl PassReport {
    pub fn new(pass: PassKind, kind: Option<StrategyKind>, started_at: DateTime<Utc>) -> Self {
        Self {
            pass,
            kind,
            started_at,
            bought: Vec::new(),
            sold: Vec::new(),
            extended: Vec::new(),
            trailing_raised: Vec::new(),
            held: 0,
            skipped: Vec::new(),
            aborted: None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    pub fn skip_reason(&self, symbol: &str) -> Option<&str> {
        self.skipped
            .iter()
            .find(|item| item.symbol == symbol)
            .map(|item| item.reason.as_str())
    }

    fn skip(&mut self, symbol: &str, reason: impl Into<String>) {
        self.skipped.push(SkippedItem {
            symbol: symbol.to_string(),
            reason: reason.into(),
        });
    }

    fn abort(mut self, reason: impl Into<String>) -> Self {
        self.aborted = Some(reason.into());
        self
    }

    pub fn summary(&self) -> String {
        let scope = match self.kind {
            Some(kind) => format!("{} {}", kind.label(), self.pass.label()),
            None => self.pass.label().to_string(),
        };
        if let Some(reason) = &self.aborted {
            return format!("{} pass aborted: {}", scope, reason);
        }
        format!(
            "{} pass: {} bought, {} sold, {} extended, {} trailing raised, {} held, {} skipped",
            scope,
            self.bought.len(),
            self.sold.len(),
            self.extended.len(),
            self.trailing_raised.len(),
            self.held,
            self.skipped.len()
        )
    }
}

/// Per-item result inside a pass.
enum ItemOutcome {
    Bought(Position),
    Sold(Position),
    Extended,
    TrailingRaised,
    Held,
    Skipped(String),
}

/// Runs `pass` so that neither an error nor a panic escapes: both become an
/// aborted report, logged and notified.
async fn guarded<F>(
    context: &AppContext,
    pass: PassKind,
    kind: Option<StrategyKind>,
    started_at: DateTime<Utc>,
    body: F,
) -> PassReport
where
    F: Future<Output = PassReport>,
{
    match AssertUnwindSafe(body).catch_unwind().await {
        Ok(report) => {
            info!("{}", report.summary());
            report
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!("{} pass panicked: {}", pass.label(), message);
            notify(
                context.notifier(),
                &notifications::pass_error(kind, pass.label(), &message),
            )
            .await;
            PassReport::new(pass, kind, started_at).abort(format!("panic: {}", message))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

async fn abort_with_notice(
    context: &AppContext,
    report: PassReport,
    reason: String,
) -> PassReport {
    error!("{} pass aborted: {}", report.pass.label(), reason);
    notify(
        context.notifier(),
        &notifications::pass_error(report.kind, report.pass.label(), &reason),
    )
    .await;
    report.abort(reason)
}

fn entry_reservation_reason(err: &LedgerError) -> &'static str {
    match err {
        LedgerError::Busy { .. } => "busy",
        LedgerError::AlreadyOpen { .. } => "already_open",
        LedgerError::DailyCapReached { .. } => "daily_cap",
        LedgerError::PortfolioCapReached { .. } => "portfolio_cap",
        _ => "not_reserved",
    }
}

fn ledger_failure(err: LedgerError) -> TradingError {
    match err {
        LedgerError::Store(inner) => inner,
        other => TradingError::Persistence(other.to_string()),
    }
}

pub async fn run_entry_pass(context: &AppContext, kind: StrategyKind, now: DateTime<Utc>) -> PassReport {
    guarded(context, PassKind::Entry, Some(kind), now, entry_pass(context, kind, now)).await
}

pub async fn run_exit_pass(context: &AppContext, kind: StrategyKind, now: DateTime<Utc>) -> PassReport {
    guarded(context, PassKind::Exit, Some(kind), now, exit_pass(context, kind, now)).await
}

pub async fn run_status_pass(context: &AppContext, now: DateTime<Utc>) -> PassReport {
    guarded(context, PassKind::Status, None, now, status_pass(context, now)).await
}

pub async fn run_auth_pass(context: &AppContext, now: DateTime<Utc>) -> PassReport {
    guarded(context, PassKind::Auth, None, now, auth_pass(context, now)).await
}

async fn entry_pass(context: &AppContext, kind: StrategyKind, now: DateTime<Utc>) -> PassReport {
    let report = PassReport::new(PassKind::Entry, Some(kind), now);
    let settings = context.settings();
    let profile = settings.profile(kind);
    let calendar = &settings.calendar;
    let local = calendar.local_datetime(now);

    if let Some(reason) = settings.market_closed_reason(now) {
        info!("{} entry pass skipped at {}: {}", kind, local, reason);
        return report.abort(reason);
    }
    if let Some(reason) = profile.entry_blocked_reason(local) {
        info!("{} entry pass skipped: {}", kind, reason);
        notify(
            context.notifier(),
            &notifications::pass_skipped(kind, PassKind::Entry.label(), reason),
        )
        .await;
        return report.abort(reason);
    }

    let mut candidates = match context.scanner().candidates_for(kind).await {
        Ok(candidates) => candidates,
        Err(err) => {
            return abort_with_notice(context, report, format!("scan list unavailable: {}", err)).await
        }
    };
    if candidates.is_empty() {
        info!("{} entry pass: no scan candidates", kind);
        return report;
    }

    let capital = match context.gateway().available_funds().await {
        Ok(funds) => funds,
        Err(err) if err.is_authentication() => {
            return abort_with_notice(context, report, err.to_string()).await
        }
        Err(err) => {
            warn!(
                "Could not read available funds ({}); using configured capital {:.2}",
                err, settings.account_capital
            );
            settings.account_capital
        }
    };

    let daily_unique_buys = match context.ledger().count_unique_buys_today(kind, now).await {
        Ok(count) => count,
        Err(err) => return abort_with_notice(context, report, err.to_string()).await,
    };
    let evaluator = EntryEvaluator::new(profile, calendar);
    let slots = evaluator.available_slots(capital, daily_unique_buys);
    if slots == 0 {
        let reason = format!(
            "no slots (capital {:.2}, {} of {} buys today)",
            capital, daily_unique_buys, profile.daily_buy_cap
        );
        info!("{} entry pass skipped: {}", kind, reason);
        notify(
            context.notifier(),
            &notifications::pass_skipped(kind, PassKind::Entry.label(), &reason),
        )
        .await;
        return report.abort(reason);
    }

    candidates.sort_by(|a, b| b.percent_change.total_cmp(&a.percent_change));
    run_entry_candidates(context, report, profile, &evaluator, candidates, capital, slots, now).await
}

#[allow(clippy::too_many_arguments)]
async fn run_entry_candidates(
    context: &AppContext,
    mut report: PassReport,
    profile: &StrategyProfile,
    evaluator: &EntryEvaluator<'_>,
    candidates: Vec<ScanCandidate>,
    mut capital: f64,
    mut slots: usize,
    now: DateTime<Utc>,
) -> PassReport {
    let calendar = &context.settings().calendar;
    for candidate in candidates {
        if slots == 0 {
            info!("{} entry pass: no slots left", profile.kind);
            break;
        }

        match enter_candidate(context, profile, evaluator, &candidate, capital, now).await {
            Ok(ItemOutcome::Bought(position)) => {
                capital -= position.cost_basis();
                slots -= 1;
                notify(context.notifier(), &notifications::buy_alert(&position, calendar)).await;
                report.bought.push(position);
            }
            Ok(ItemOutcome::Skipped(reason)) => report.skip(&candidate.symbol, reason),
            Ok(_) => {}
            Err(err) if err.is_authentication() => {
                return abort_with_notice(context, report, err.to_string()).await
            }
            Err(err) => {
                warn!("Skipping {} candidate {}: {}", profile.kind, candidate.symbol, err);
                report.skip(&candidate.symbol, err.to_string());
            }
        }
    }
    report
}

async fn enter_candidate(
    context: &AppContext,
    profile: &StrategyProfile,
    evaluator: &EntryEvaluator<'_>,
    candidate: &ScanCandidate,
    capital: f64,
    now: DateTime<Utc>,
) -> Result<ItemOutcome, TradingError> {
    let kind = profile.kind;
    let symbol = candidate.symbol.as_str();
    let ledger = context.ledger();

    let entry_context = EntryContext {
        now,
        has_open_position: ledger
            .has_open_position(symbol, kind)
            .await
            .map_err(ledger_failure)?,
        recently_profitable: ledger
            .was_recently_profitable(symbol, profile.cooldown_trading_days, now)
            .await
            .map_err(ledger_failure)?,
        daily_unique_buys: ledger
            .count_unique_buys_today(kind, now)
            .await
            .map_err(ledger_failure)?,
        open_positions: ledger
            .count_open_positions(kind)
            .await
            .map_err(ledger_failure)?,
        capital,
    };
    if let Some(EntryDecision::Skip { reason, details }) = evaluator.check_limits(&entry_context) {
        info!("Skipping {} {}: {} {}", kind, symbol, reason, details.unwrap_or_default());
        return Ok(ItemOutcome::Skipped(reason.to_string()));
    }

    let bars = sanitize_bars(
        context
            .market_data()
            .get_bars(symbol, profile.bar_interval, profile.bar_lookback)
            .await?,
    );
    let quote = context.market_data().get_quote(symbol).await?;
    let snapshot = IndicatorSnapshot::compute(&bars, profile);

    let plan = match evaluator.evaluate(candidate, &quote, &snapshot, &entry_context) {
        EntryDecision::Buy(plan) => plan,
        EntryDecision::Skip { reason, details } => {
            info!("Skipping {} {}: {} {}", kind, symbol, reason, details.unwrap_or_default());
            return Ok(ItemOutcome::Skipped(reason.to_string()));
        }
    };

    // Held through the order so the caps checked here still hold when the fill is recorded.
    let reservation = match ledger.reserve_entry(symbol, kind, now).await {
        Ok(reservation) => reservation,
        Err(LedgerError::Store(err)) => return Err(err),
        Err(err) => {
            let reason = entry_reservation_reason(&err);
            info!("Skipping {} {}: {} ({})", kind, symbol, reason, err);
            return Ok(ItemOutcome::Skipped(reason.to_string()));
        }
    };
    let order = OrderRequest {
        side: OrderSide::Buy,
        exchange: context.settings().exchange.clone(),
        instrument_token: context.gateway().instrument_token(symbol).await?,
        order_type: plan.order_type,
        product_type: profile.product_type,
        quantity: plan.quantity,
        price: plan.fill_price,
    };
    let order_id = match context.gateway().submit_order(&order).await {
        Ok(order_id) => order_id,
        Err(TradingError::OrderRejected(message)) => {
            warn!("{} buy order for {} rejected: {}", kind, symbol, message);
            return Ok(ItemOutcome::Skipped(format!("order_rejected: {}", message)));
        }
        Err(err) => return Err(err),
    };

    match ledger
        .open_reserved(&reservation, plan.into_draft(Some(order_id.clone()), now))
        .await
    {
        Ok(position) => Ok(ItemOutcome::Bought(position)),
        Err(err) => {
            error!(
                "Order {} for {} {} filled but the position was not recorded: {}",
                order_id, kind, symbol, err
            );
            Ok(ItemOutcome::Skipped(err.to_string()))
        }
    }
}

async fn exit_pass(context: &AppContext, kind: StrategyKind, now: DateTime<Utc>) -> PassReport {
    let mut report = PassReport::new(PassKind::Exit, Some(kind), now);
    let settings = context.settings();
    let profile = settings.profile(kind);

    if let Some(reason) = settings.market_closed_reason(now) {
        info!(
            "{} exit pass skipped at {}: {}",
            kind,
            settings.calendar.local_datetime(now),
            reason
        );
        return report.abort(reason);
    }

    let positions = match context.ledger().open_positions(kind).await {
        Ok(positions) => positions,
        Err(err) => return abort_with_notice(context, report, err.to_string()).await,
    };
    if positions.is_empty() {
        info!("{} exit pass: no open positions", kind);
        return report;
    }

    let scanned: HashSet<String> = match context.scanner().candidates_for(kind).await {
        Ok(candidates) => candidates.into_iter().map(|candidate| candidate.symbol).collect(),
        Err(err) => {
            warn!("{} scan list unavailable for exit pass: {}", kind, err);
            HashSet::new()
        }
    };

    let evaluator = ExitEvaluator::new(profile, &settings.calendar);
    for position in positions {
        let in_scan_list = scanned.contains(&position.symbol);
        match exit_position(context, profile, &evaluator, &position, in_scan_list, now).await {
            Ok(ItemOutcome::Sold(closed)) => {
                if let Some(text) = notifications::sell_alert(&closed, &settings.calendar) {
                    notify(context.notifier(), &text).await;
                }
                report.sold.push(closed);
            }
            Ok(ItemOutcome::Extended) => report.extended.push(position.symbol.clone()),
            Ok(ItemOutcome::TrailingRaised) => report.trailing_raised.push(position.symbol.clone()),
            Ok(ItemOutcome::Held) => report.held += 1,
            Ok(ItemOutcome::Skipped(reason)) => report.skip(&position.symbol, reason),
            Ok(ItemOutcome::Bought(_)) => {}
            Err(err) if err.is_authentication() => {
                return abort_with_notice(context, report, err.to_string()).await
            }
            Err(err) => {
                warn!("Skipping {} position {}: {}", kind, position.symbol, err);
                report.skip(&position.symbol, err.to_string());
            }
        }
    }
    report
}

async fn exit_position(
    context: &AppContext,
    profile: &StrategyProfile,
    evaluator: &ExitEvaluator<'_>,
    position: &Position,
    in_scan_list: bool,
    now: DateTime<Utc>,
) -> Result<ItemOutcome, TradingError> {
    let kind = profile.kind;
    let symbol = position.symbol.as_str();
    let ledger = context.ledger();

    let quote = context.market_data().get_quote(symbol).await?;
    let bars = sanitize_bars(
        context
            .market_data()
            .get_bars(symbol, profile.bar_interval, profile.bar_lookback)
            .await?,
    );
    let snapshot = IndicatorSnapshot::compute(&bars, profile);

    let decision = evaluator.evaluate(position, &quote, &snapshot, &ExitContext { now, in_scan_list });
    let updated = match decision {
        ExitDecision::Extend { new_expiry } => ledger
            .extend_expiry(symbol, kind, new_expiry, now)
            .await
            .map(|_| ItemOutcome::Extended),
        ExitDecision::Hold {
            trailing: Some(update),
        } => ledger
            .raise_trailing_stop(symbol, kind, update.level, update.peak_price, now)
            .await
            .map(|_| ItemOutcome::TrailingRaised),
        ExitDecision::Hold { trailing: None } => return Ok(ItemOutcome::Held),
        ExitDecision::Sell { reason, price } => {
            let reservation = match ledger.reserve(symbol, kind) {
                Ok(reservation) => reservation,
                Err(err) => {
                    info!("{}; retrying next cycle", err);
                    return Ok(ItemOutcome::Skipped("busy".to_string()));
                }
            };
            // The decision was made on this record; skip if it was closed or replaced since.
            let current = ledger.find_open(symbol, kind).await.map_err(ledger_failure)?;
            if current.map(|open| open.id) != Some(position.id) {
                info!("{} {} changed since it was evaluated; not selling", kind, symbol);
                return Ok(ItemOutcome::Skipped("not_open".to_string()));
            }
            info!("Selling {} {} @ {:.2}: {}", kind, symbol, price, reason);
            let order = OrderRequest {
                side: OrderSide::Sell,
                exchange: context.settings().exchange.clone(),
                instrument_token: context.gateway().instrument_token(symbol).await?,
                order_type: OrderType::Market,
                product_type: profile.product_type,
                quantity: position.quantity,
                price,
            };
            match context.gateway().submit_order(&order).await {
                Ok(_) => {}
                Err(TradingError::OrderRejected(message)) => {
                    warn!("{} sell order for {} rejected: {}", kind, symbol, message);
                    return Ok(ItemOutcome::Skipped(format!("order_rejected: {}", message)));
                }
                Err(err) => return Err(err),
            }
            ledger
                .close_reserved(&reservation, position.id, now, price, reason)
                .await
                .map(ItemOutcome::Sold)
        }
    };

    match updated {
        Ok(outcome) => Ok(outcome),
        Err(err) if err.is_busy() => {
            info!("{}; retrying next cycle", err);
            Ok(ItemOutcome::Skipped("busy".to_string()))
        }
        Err(LedgerError::Store(err)) => Err(err),
        Err(err) => Ok(ItemOutcome::Skipped(err.to_string())),
    }
}

async fn status_pass(context: &AppContext, now: DateTime<Utc>) -> PassReport {
    let mut report = PassReport::new(PassKind::Status, None, now);
    let mut marks = Vec::new();
    for kind in StrategyKind::ALL {
        let positions = match context.ledger().open_positions(kind).await {
            Ok(positions) => positions,
            Err(err) => return abort_with_notice(context, report, err.to_string()).await,
        };
        for position in positions {
            let price = match context.market_data().get_quote(&position.symbol).await {
                Ok(quote) if quote.last_price > 0.0 => Some(quote.last_price),
                Ok(_) => None,
                Err(err) => {
                    warn!("No quote for {} status: {}", position.symbol, err);
                    None
                }
            };
            report.held += 1;
            marks.push((position, price));
        }
    }

    notify(
        context.notifier(),
        &notifications::status_report(&marks, &context.settings().calendar),
    )
    .await;
    report
}

async fn auth_pass(context: &AppContext, now: DateTime<Utc>) -> PassReport {
    let report = PassReport::new(PassKind::Auth, None, now);
    match context.gateway().authenticate().await {
        Ok(()) => {
            info!("Broker session refreshed");
            report
        }
        Err(err) => abort_with_notice(context, report, err.to_string()).await,
    }
}
