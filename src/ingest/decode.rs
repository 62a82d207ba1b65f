// Sample decoding
// Parses raw transport payloads (JSON or fixed binary layout) into typed samples

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the fixed binary layout: 1 id byte + three 32-bit floats
pub const BINARY_SAMPLE_LEN: usize = 13;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary payload must be {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Device id byte 0x{0:02x} is not printable ASCII")]
    InvalidDeviceId(u8),

    #[error("Non-finite value in field {0}")]
    NonFinite(&'static str),

    #[error("Empty payload")]
    Empty,
}

/// Payload shape expected on the subscribe topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Sniff: JSON when the payload opens with `{` or `[`, binary at 13 bytes
    #[default]
    Auto,
    Json,
    Binary,
}

/// Float byte order of the binary layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

/// One gyroscope reading from a wearable sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device_id: String,

    /// Device clock in milliseconds, non-decreasing per device
    pub timestamp_ms: i64,

    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,

    /// Device temperature (°C), not sent by every firmware
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl Sample {
    pub fn new(
        device_id: impl Into<String>,
        timestamp_ms: i64,
        gyro_x: f64,
        gyro_y: f64,
        gyro_z: f64,
    ) -> Self {
        Sample {
            device_id: device_id.into(),
            timestamp_ms,
            gyro_x,
            gyro_y,
            gyro_z,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

// Wire shape published by the sensor firmware
#[derive(Debug, Deserialize)]
struct WireSample {
    #[serde(rename = "ID", default)]
    id: Option<String>,
    #[serde(rename = "gyX")]
    gy_x: f64,
    #[serde(rename = "gyY")]
    gy_y: f64,
    #[serde(rename = "gyZ")]
    gy_z: f64,
    #[serde(default)]
    temp: Option<f64>,
    #[serde(default)]
    millis: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WirePayload {
    One(WireSample),
    Batch(Vec<WireSample>),
}

/// Decoder bound to the deployment's wire settings
#[derive(Debug, Clone)]
pub struct SampleDecoder {
    format: WireFormat,
    byte_order: ByteOrder,
    default_device_id: String,
}

impl SampleDecoder {
    pub fn new(format: WireFormat, byte_order: ByteOrder, default_device_id: impl Into<String>) -> Self {
        SampleDecoder {
            format,
            byte_order,
            default_device_id: default_device_id.into(),
        }
    }

    /// Decode one transport payload into zero or more samples
    /// `received_at_ms` stamps samples that carry no device clock
    pub fn decode(&self, payload: &[u8], received_at_ms: i64) -> Result<Vec<Sample>, DecodeError> {
        match self.format {
            WireFormat::Json => decode_json(payload, received_at_ms, &self.default_device_id),
            WireFormat::Binary => {
                decode_binary(payload, self.byte_order, received_at_ms).map(|s| vec![s])
            }
            WireFormat::Auto => {
                if looks_like_json(payload) {
                    match decode_json(payload, received_at_ms, &self.default_device_id) {
                        Ok(samples) => Ok(samples),
                        // A binary frame whose id byte happens to be '{' or '['
                        Err(_) if payload.len() == BINARY_SAMPLE_LEN => {
                            decode_binary(payload, self.byte_order, received_at_ms).map(|s| vec![s])
                        }
                        Err(e) => Err(e),
                    }
                } else if payload.len() == BINARY_SAMPLE_LEN {
                    decode_binary(payload, self.byte_order, received_at_ms).map(|s| vec![s])
                } else {
                    decode_json(payload, received_at_ms, &self.default_device_id)
                }
            }
        }
    }
}

fn looks_like_json(payload: &[u8]) -> bool {
    payload
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .map(|b| *b == b'{' || *b == b'[')
        .unwrap_or(false)
}

/// Decode a JSON object or array of objects
pub fn decode_json(
    payload: &[u8],
    received_at_ms: i64,
    default_device_id: &str,
) -> Result<Vec<Sample>, DecodeError> {
    if payload.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(DecodeError::Empty);
    }

    let wire: WirePayload = serde_json::from_slice(payload)?;
    let points = match wire {
        WirePayload::One(point) => vec![point],
        WirePayload::Batch(points) => points,
    };

    points
        .into_iter()
        .map(|point| {
            let sample = Sample {
                device_id: point
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| default_device_id.to_string()),
                timestamp_ms: point.millis.unwrap_or(received_at_ms),
                gyro_x: point.gy_x,
                gyro_y: point.gy_y,
                gyro_z: point.gy_z,
                temperature: point.temp,
            };
            check_finite(&sample)?;
            Ok(sample)
        })
        .collect()
}

/// Decode the 13-byte layout: id char, gyX, gyY, gyZ as f32
pub fn decode_binary(
    payload: &[u8],
    byte_order: ByteOrder,
    received_at_ms: i64,
) -> Result<Sample, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }
    if payload.len() != BINARY_SAMPLE_LEN {
        return Err(DecodeError::InvalidLength {
            expected: BINARY_SAMPLE_LEN,
            actual: payload.len(),
        });
    }

    let id = payload[0];
    if !id.is_ascii_graphic() {
        return Err(DecodeError::InvalidDeviceId(id));
    }

    let sample = Sample {
        device_id: (id as char).to_string(),
        timestamp_ms: received_at_ms,
        gyro_x: read_f32(&payload[1..5], byte_order) as f64,
        gyro_y: read_f32(&payload[5..9], byte_order) as f64,
        gyro_z: read_f32(&payload[9..13], byte_order) as f64,
        temperature: None,
    };
    check_finite(&sample)?;

    Ok(sample)
}

fn read_f32(bytes: &[u8], byte_order: ByteOrder) -> f32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    match byte_order {
        ByteOrder::Little => f32::from_le_bytes(buf),
        ByteOrder::Big => f32::from_be_bytes(buf),
    }
}

fn check_finite(sample: &Sample) -> Result<(), DecodeError> {
    if !sample.gyro_x.is_finite() {
        return Err(DecodeError::NonFinite("gyX"));
    }
    if !sample.gyro_y.is_finite() {
        return Err(DecodeError::NonFinite("gyY"));
    }
    if !sample.gyro_z.is_finite() {
        return Err(DecodeError::NonFinite("gyZ"));
    }
    if matches!(sample.temperature, Some(t) if !t.is_finite()) {
        return Err(DecodeError::NonFinite("temp"));
    }
    Ok(())
}
