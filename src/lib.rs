pub mod backtester;
pub mod bar_utils;
pub mod calendar;
pub mod commands;
pub mod config;
pub mod context;
pub mod database;
pub mod entry;
pub mod error;
pub mod exit;
pub mod indicators;
pub mod ledger;
pub mod models;
pub mod notifications;
pub mod paper_broker;
pub mod passes;
pub mod performance;
pub mod providers;
pub mod retry;
pub mod scanner;
pub mod secrets;
pub mod store;
pub mod strategy;
pub mod telegram;
pub mod trading_rules;
pub mod yahoo;
