pub mod accounts;
pub mod api;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod hub;
pub mod ledger;
pub mod model;
pub mod session;
pub mod store;
pub mod views;
