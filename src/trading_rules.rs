pub const PRICE_EPSILON: f64 = 1e-6;

/// `floor(capital × riskFraction / perShareRisk)`. Zero or less means skip.
pub fn size(capital: f64, risk_fraction: f64, per_share_risk: f64) -> i64 {
    if !capital.is_finite() || !risk_fraction.is_finite() || !per_share_risk.is_finite() {
        return 0;
    }
    if per_share_risk <= 0.0 {
        return 0;
    }
    let risk_per_trade = capital * risk_fraction;
    if risk_per_trade <= 0.0 {
        return 0;
    }
    (risk_per_trade / per_share_risk).floor() as i64
}

/// Stop distance per share: `ATR × multiplier`, or a percentage of price when
/// ATR is not available.
pub fn per_share_risk(
    price: f64,
    atr: Option<f64>,
    atr_multiplier: f64,
    fallback_percent: f64,
) -> Option<f64> {
    let from_atr = atr
        .filter(|value| value.is_finite() && *value > 0.0)
        .map(|value| value * atr_multiplier)
        .filter(|value| *value > 0.0);
    let risk = from_atr.unwrap_or(price * fallback_percent / 100.0);
    if risk.is_finite() && risk > 0.0 {
        Some(risk)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionAllocation {
    pub quantity: i32,
    pub risk_per_trade: f64,
    pub trade_value: f64,
}

#[derive(Debug, PartialEq)]
pub enum PositionSizingOutcome {
    Sized(PositionAllocation),
    TooSmall,
    InsufficientCash { required: f64 },
}

pub struct PositionSizingParams {
    pub price: f64,
    pub capital: f64,
    pub risk_fraction: f64,
    pub per_share_risk: f64,
}

/// Risk-based quantity, trimmed to what the capital can pay for.
pub fn determine_position_size(params: PositionSizingParams) -> PositionSizingOutcome {
    let PositionSizingParams {
        price,
        capital,
        risk_fraction,
        per_share_risk,
    } = params;

    if price <= 0.0 || !price.is_finite() || !capital.is_finite() {
        return PositionSizingOutcome::TooSmall;
    }

    let risk_quantity = size(capital, risk_fraction, per_share_risk);
    if risk_quantity <= 0 {
        return PositionSizingOutcome::TooSmall;
    }

    let affordable = ((capital.max(0.0) + PRICE_EPSILON) / price).floor() as i64;
    if affordable <= 0 {
        return PositionSizingOutcome::InsufficientCash { required: price };
    }

    let quantity = risk_quantity.min(affordable).min(i32::MAX as i64) as i32;
    PositionSizingOutcome::Sized(PositionAllocation {
        quantity,
        risk_per_trade: capital * risk_fraction,
        trade_value: quantity as f64 * price,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectiveLevels {
    pub stop_loss: f64,
    pub target: f64,
}

pub fn protective_levels(fill_price: f64, per_share_risk: f64, reward_multiple: f64) -> ProtectiveLevels {
    ProtectiveLevels {
        stop_loss: fill_price - per_share_risk,
        target: fill_price + reward_multiple * per_share_risk,
    }
}

/// Stop level used by the exit rules: buy price less `ATR × multiplier`, or
/// less a percentage of the buy price without ATR.
pub fn volatility_stop(
    buy_price: f64,
    atr: Option<f64>,
    atr_multiplier: f64,
    fallback_percent: f64,
) -> f64 {
    match per_share_risk(buy_price, atr, atr_multiplier, fallback_percent) {
        Some(risk) => buy_price - risk,
        None => buy_price,
    }
}
