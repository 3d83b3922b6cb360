//! Access-code issuance: a 6-digit PIN plus an SVG QR code of the access payload.

use chrono::{DateTime, SecondsFormat, Utc};
use qrcode::render::svg;
use qrcode::QrCode;
use rand::Rng;
use serde::Serialize;
use uuid::Uuid;

/// Minimum rendered QR size in pixels.
const QR_MIN_DIMENSION: u32 = 256;

#[derive(Debug, Serialize)]
struct AccessPayload<'a> {
    booking_id: Uuid,
    access_pin: &'a str,
    valid_from: String,
    valid_until: String,
    generated_at: String,
}

/// Issues access credentials for a booking.
pub trait AccessCodeIssuer: Send + Sync {
    fn generate_pin(&self) -> String;

    fn encode_access_payload(
        &self,
        booking_id: Uuid,
        pin: &str,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    ) -> Result<String, anyhow::Error>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QrAccessCodeIssuer;

impl AccessCodeIssuer for QrAccessCodeIssuer {
    fn generate_pin(&self) -> String {
        generate_pin()
    }

    fn encode_access_payload(
        &self,
        booking_id: Uuid,
        pin: &str,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    ) -> Result<String, anyhow::Error> {
        encode_access_payload(booking_id, pin, valid_from, valid_until)
    }
}

/// Uniform PIN in `100000..=999999`. Not unique across bookings.
pub fn generate_pin() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// JSON access payload rendered as an SVG QR code.
pub fn encode_access_payload(
    booking_id: Uuid,
    pin: &str,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
) -> Result<String, anyhow::Error> {
    let payload = AccessPayload {
        booking_id,
        access_pin: pin,
        valid_from: rfc3339(valid_from),
        valid_until: rfc3339(valid_until),
        generated_at: rfc3339(Utc::now()),
    };
    let json = serde_json::to_string(&payload)?;

    let code = QrCode::new(json.as_bytes())
        .map_err(|e| anyhow::anyhow!("QR code generation failed: {}", e))?;

    Ok(code
        .render::<svg::Color>()
        .min_dimensions(QR_MIN_DIMENSION, QR_MIN_DIMENSION)
        .quiet_zone(true)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_are_six_digits() {
        for _ in 0..200 {
            let pin = generate_pin();
            assert_eq!(pin.len(), 6);
            assert!(pin.chars().all(|c| c.is_ascii_digit()));
            assert!(!pin.starts_with('0'));
        }
    }

    #[test]
    fn payload_renders_as_svg() {
        let from = Utc::now();
        let until = from + chrono::Duration::hours(2);
        let svg = QrAccessCodeIssuer
            .encode_access_payload(Uuid::new_v4(), "482913", from, until)
            .unwrap();

        assert!(svg.contains("<svg"));
        assert!(svg.contains("#000000"));
    }
}
