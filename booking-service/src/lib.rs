//! booking-service: pod reservations, access codes and payment reconciliation.

pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;

pub use startup::{AppState, Application};
