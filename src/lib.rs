// Swap Engine - simulated meme coin swaps settled against real Solana transactions
pub mod api;
pub mod balance;
pub mod config;
pub mod error;
pub mod execution;
pub mod history;
pub mod leaderboards;
pub mod ledger;
pub mod models;
pub mod poller;
pub mod portfolio;
pub mod price;
pub mod quote;
pub mod reconcile;
pub mod store;
pub mod trade;
pub mod wallet;

#[cfg(test)]
mod testing;
