use crate::error::TradingError;
use crate::models::OrderSide;
use crate::providers::{OrderGateway, OrderRequest};
use async_trait::async_trait;
use log::info;
use std::sync::Mutex;
use uuid::Uuid;

/// Order gateway that fills every valid order immediately against a
/// simulated cash balance. Instrument tokens are the normalised symbols.
pub struct PaperOrderGateway {
    funds: Mutex<f64>,
    orders: Mutex<Vec<(String, OrderRequest)>>,
}

impl PaperOrderGateway {
    pub fn new(starting_funds: f64) -> Self {
        Self {
            funds: Mutex::new(starting_funds.max(0.0)),
            orders: Mutex::new(Vec::new()),
        }
    }

    pub fn submitted_orders(&self) -> Vec<(String, OrderRequest)> {
        self.orders
            .lock()
            .map(|orders| orders.clone())
            .unwrap_or_default()
    }

    fn validate(order: &OrderRequest) -> Result<(), TradingError> {
        if order.quantity <= 0 {
            return Err(TradingError::OrderRejected(format!(
                "quantity must be positive, got {}",
                order.quantity
            )));
        }
        if !(order.price.is_finite() && order.price > 0.0) {
            return Err(TradingError::OrderRejected(format!(
                "no usable price for {}",
                order.instrument_token
            )));
        }
        if order.instrument_token.trim().is_empty() {
            return Err(TradingError::OrderRejected("missing instrument token".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderGateway for PaperOrderGateway {
    async fn authenticate(&self) -> Result<(), TradingError> {
        Ok(())
    }

    async fn instrument_token(&self, symbol: &str) -> Result<String, TradingError> {
        let token = symbol.trim().to_uppercase();
        if token.is_empty() {
            return Err(TradingError::DataUnavailable("empty symbol".to_string()));
        }
        Ok(token)
    }

    async fn available_funds(&self) -> Result<f64, TradingError> {
        self.funds
            .lock()
            .map(|funds| *funds)
            .map_err(|_| TradingError::Persistence("paper funds lock poisoned".to_string()))
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<String, TradingError> {
        Self::validate(order)?;
        let notional = order.price * order.quantity as f64;
        {
            let mut funds = self
                .funds
                .lock()
                .map_err(|_| TradingError::Persistence("paper funds lock poisoned".to_string()))?;
            match order.side {
                OrderSide::Buy if notional > *funds => {
                    return Err(TradingError::OrderRejected(format!(
                        "insufficient funds: {:.2} required, {:.2} available",
                        notional, *funds
                    )));
                }
                OrderSide::Buy => *funds -= notional,
                OrderSide::Sell => *funds += notional,
            }
        }

        let order_id = Uuid::new_v4().to_string();
        if let Ok(mut orders) = self.orders.lock() {
            orders.push((order_id.clone(), order.clone()));
        }
        info!(
            "Paper {} {} x{} @ {:.2} ({} {}) -> {}",
            order.side.as_str(),
            order.instrument_token,
            order.quantity,
            order.price,
            order.order_type.as_str(),
            order.product_type.as_str(),
            order_id
        );
        Ok(order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderType, ProductType};

    fn order(side: OrderSide, quantity: i32, price: f64) -> OrderRequest {
        OrderRequest {
            side,
            exchange: "NSE".to_string(),
            instrument_token: "TCS".to_string(),
            order_type: OrderType::Limit,
            product_type: ProductType::Delivery,
            quantity,
            price,
        }
    }

    #[tokio::test]
    async fn fills_move_cash() {
        let gateway = PaperOrderGateway::new(10_000.0);
        gateway.submit_order(&order(OrderSide::Buy, 20, 400.0)).await.unwrap();
        assert!((gateway.available_funds().await.unwrap() - 2_000.0).abs() < 1e-9);

        gateway.submit_order(&order(OrderSide::Sell, 20, 410.0)).await.unwrap();
        assert!((gateway.available_funds().await.unwrap() - 10_200.0).abs() < 1e-9);
        assert_eq!(gateway.submitted_orders().len(), 2);
    }

    #[tokio::test]
    async fn invalid_or_unaffordable_orders_are_rejected() {
        let gateway = PaperOrderGateway::new(1_000.0);
        for bad in [order(OrderSide::Buy, 0, 100.0), order(OrderSide::Buy, 5, 0.0), order(OrderSide::Buy, 50, 100.0)] {
            match gateway.submit_order(&bad).await {
                Err(TradingError::OrderRejected(_)) => {}
                other => panic!("expected rejection, got {:?}", other),
            }
        }
        assert!((gateway.available_funds().await.unwrap() - 1_000.0).abs() < 1e-9);
        assert!(gateway.submitted_orders().is_empty());
    }
}
