pub mod auth;
pub mod backtest;
pub mod buy;
pub mod encrypt_secret;
pub mod sell;
pub mod status;
