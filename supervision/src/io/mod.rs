//! Side-effecting helpers: the store boundary, files and configuration.

pub mod agency_store;
pub mod agent;
pub mod config;
pub mod memory_agency;
