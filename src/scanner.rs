use crate::bar_utils::normalize_symbol;
use crate::error::TradingError;
use crate::models::ScanCandidate;
use crate::providers::CandidateScanner;
use async_trait::async_trait;
use log::warn;
use std::path::{Path, PathBuf};

/// Reads scanner output dropped as JSON arrays of candidates, one file per
/// strategy kind.
pub struct JsonFileScanner {
    swing_path: Option<PathBuf>,
    scalping_path: Option<PathBuf>,
}

impl JsonFileScanner {
    pub fn new(swing_path: Option<PathBuf>, scalping_path: Option<PathBuf>) -> Self {
        Self {
            swing_path,
            scalping_path,
        }
    }

    async fn read(path: Option<&Path>, label: &str) -> Result<Vec<ScanCandidate>, TradingError> {
        let Some(path) = path else {
            return Err(TradingError::DataUnavailable(format!(
                "no {} scan file configured",
                label
            )));
        };
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            TradingError::DataUnavailable(format!("{}: {}", path.display(), err))
        })?;
        parse_candidates(&raw)
            .map_err(|err| TradingError::DataUnavailable(format!("{}: {}", path.display(), err)))
    }
}

/// Parses a candidate list, dropping entries without a usable symbol and
/// keeping the first entry of a repeated symbol.
pub fn parse_candidates(raw: &str) -> Result<Vec<ScanCandidate>, serde_json::Error> {
    let parsed: Vec<ScanCandidate> = serde_json::from_str(raw)?;
    let mut candidates: Vec<ScanCandidate> = Vec::with_capacity(parsed.len());
    for mut candidate in parsed {
        let Some(symbol) = normalize_symbol(&candidate.symbol) else {
            warn!("Skipping scan entry without a symbol ({})", candidate.name);
            continue;
        };
        if candidates.iter().any(|existing| existing.symbol == symbol) {
            continue;
        }
        candidate.symbol = symbol;
        candidates.push(candidate);
    }
    Ok(candidates)
}

#[async_trait]
impl CandidateScanner for JsonFileScanner {
    async fn get_candidates(&self) -> Result<Vec<ScanCandidate>, TradingError> {
        Self::read(self.swing_path.as_deref(), "swing").await
    }

    async fn get_scalping_candidates(&self) -> Result<Vec<ScanCandidate>, TradingError> {
        Self::read(self.scalping_path.as_deref(), "scalping").await
    }
}
