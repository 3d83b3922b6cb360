pub mod access_code;
pub mod database;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod payment_repository;
pub mod payments;
pub mod reservation;

pub use access_code::{AccessCodeIssuer, QrAccessCodeIssuer};
pub use database::Database;
pub use error::{ErrorKind, ServiceError};
pub use gateway::{CashfreeClient, MockGateway, PaymentGateway};
pub use metrics::{get_metrics, init_metrics};
pub use payments::PaymentEngine;
pub use reservation::ReservationEngine;
