use crate::config::{load_settings_map, EngineSettings};
use crate::database::PostgresPositionStore;
use crate::ledger::{LedgerLimits, PositionLedger};
use crate::models::StrategyKind;
use crate::paper_broker::PaperOrderGateway;
use crate::providers::{CandidateScanner, MarketDataProvider, NotificationChannel, OrderGateway};
use crate::retry::Resilient;
use crate::scanner::JsonFileScanner;
use crate::store::{InMemoryPositionStore, PositionStore};
use crate::telegram::{LogNotifier, TelegramNotifier};
use crate::yahoo::YahooMarketData;
use anyhow::{Context, Result};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

/// Everything a pass or command needs: settings, the ledger and the
/// external collaborators behind their traits.
#[derive(Clone)]
pub struct AppContext {
    settings: Arc<EngineSettings>,
    ledger: PositionLedger,
    market_data: Arc<dyn MarketDataProvider>,
    gateway: Arc<dyn OrderGateway>,
    scanner: Arc<dyn CandidateScanner>,
    notifier: Arc<dyn NotificationChannel>,
}

impl AppContext {
    pub async fn initialize(settings_file: Option<&Path>) -> Result<Self> {
        let settings_map = load_settings_map(settings_file)?;
        let settings = EngineSettings::from_settings_map(&settings_map)?;

        let store: Arc<dyn PositionStore> = match settings.database_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {
                let store = PostgresPositionStore::connect(url, settings.retry.timeout).await?;
                store.apply_schema().await?;
                info!("Using PostgreSQL position store");
                Arc::new(store)
            }
            _ => {
                warn!("DATABASE_URL not set. Positions are kept in memory for this run only.");
                Arc::new(InMemoryPositionStore::new())
            }
        };

        let market_data = YahooMarketData::new(
            &settings.market_data_base_url,
            &settings.market_data_symbol_suffix,
            settings.retry.timeout,
        )
        .context("failed to build market data client")?;
        let market_data: Arc<dyn MarketDataProvider> =
            Arc::new(Resilient::new(market_data, settings.retry.clone()));

        let gateway: Arc<dyn OrderGateway> = Arc::new(Resilient::new(
            PaperOrderGateway::new(settings.paper_starting_funds),
            settings.retry.clone(),
        ));

        let scanner: Arc<dyn CandidateScanner> = Arc::new(JsonFileScanner::new(
            settings.swing_scan_file.clone(),
            settings.scalping_scan_file.clone(),
        ));

        let telegram = match settings.telegram.as_ref() {
            Some(telegram) => TelegramNotifier::new(telegram, settings.retry.timeout)
                .context("failed to build Telegram client")?,
            None => None,
        };
        let notifier: Arc<dyn NotificationChannel> = match telegram {
            Some(telegram) => Arc::new(telegram),
            None => {
                info!("Telegram not configured; notifications go to the log");
                Arc::new(LogNotifier)
            }
        };

        Ok(Self::from_parts(settings, store, market_data, gateway, scanner, notifier))
    }

    /// Wires a context from already-built collaborators.
    pub fn from_parts(
        settings: EngineSettings,
        store: Arc<dyn PositionStore>,
        market_data: Arc<dyn MarketDataProvider>,
        gateway: Arc<dyn OrderGateway>,
        scanner: Arc<dyn CandidateScanner>,
        notifier: Arc<dyn NotificationChannel>,
    ) -> Self {
        let mut ledger = PositionLedger::new(store, settings.calendar.clone());
        for kind in StrategyKind::ALL {
            ledger = ledger.with_limits(kind, LedgerLimits::from(settings.profile(kind)));
        }
        Self {
            settings: Arc::new(settings),
            ledger,
            market_data,
            gateway,
            scanner,
            notifier,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn market_data(&self) -> &dyn MarketDataProvider {
        self.market_data.as_ref()
    }

    pub fn gateway(&self) -> &dyn OrderGateway {
        self.gateway.as_ref()
    }

    pub fn scanner(&self) -> &dyn CandidateScanner {
        self.scanner.as_ref()
    }

    pub fn notifier(&self) -> &dyn NotificationChannel {
        self.notifier.as_ref()
    }
}
