//! Pod inventory and user summary models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Operational status of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodStatus {
    Available,
    Occupied,
    Maintenance,
}

impl PodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Occupied => "occupied",
            Self::Maintenance => "maintenance",
        }
    }

    /// Unknown values read as `maintenance` so the pod is never bookable by accident.
    pub fn from_str(s: &str) -> Self {
        match s {
            "available" => Self::Available,
            "occupied" => Self::Occupied,
            _ => Self::Maintenance,
        }
    }
}

impl std::fmt::Display for PodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Pod {
    pub pod_id: Uuid,
    pub pod_number: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub status: String,
    pub price_per_hour: Decimal,
    pub max_capacity: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Pod {
    pub fn parsed_status(&self) -> PodStatus {
        PodStatus::from_str(&self.status)
    }

    pub fn is_available(&self) -> bool {
        self.parsed_status() == PodStatus::Available
    }
}

/// Input for registering a pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPod {
    pub pod_number: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub price_per_hour: Decimal,
    pub max_capacity: i32,
    pub latitude: f64,
    pub longitude: f64,
}

/// Pod fields embedded in booking responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSummary {
    pub pod_id: Uuid,
    pub pod_number: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub price_per_hour: Decimal,
    pub max_capacity: i32,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&Pod> for PodSummary {
    fn from(p: &Pod) -> Self {
        Self {
            pod_id: p.pod_id,
            pod_number: p.pod_number.clone(),
            description: p.description.clone(),
            address: p.address.clone(),
            price_per_hour: p.price_per_hour,
            max_capacity: p.max_capacity,
            latitude: p.latitude,
            longitude: p.longitude,
        }
    }
}

/// Pod search hit with its distance from the query point.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PodSearchResult {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub pod: Pod,
    pub distance_km: f64,
}

/// Pod geosearch parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct PodSearch {
    pub latitude: f64,
    pub longitude: f64,
    pub range_km: f64,
    pub min_capacity: Option<i32>,
    pub check_in: Option<DateTime<Utc>>,
    pub check_out: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Minimal user record; registration and authentication live elsewhere.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct UserSummary {
    pub user_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone_number: Option<String>,
}
