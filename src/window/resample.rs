// Window resampling
// Converts a variable-length sample sequence to a fixed-length grid by linear interpolation

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ingest::Sample;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("Window from device {device_id} has {len} samples, at least 2 needed")]
    InsufficientSamples { device_id: String, len: usize },

    #[error("Invalid target length {0}, must be at least 2")]
    InvalidTarget(usize),
}

/// How many points a resampled window has
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetLength {
    /// Always N points (model input length)
    Fixed(usize),

    /// Rate conversion: N = floor(len * target_hz / source_hz)
    /// Dataset collection upsamples the ~20 Hz sensor stream to 100 Hz
    Scaled { source_hz: f64, target_hz: f64 },
}

impl TargetLength {
    /// Resolve the target length for a window of `source_len` samples
    pub fn resolve(&self, source_len: usize) -> usize {
        match *self {
            TargetLength::Fixed(n) => n,
            TargetLength::Scaled { source_hz, target_hz } => {
                if source_hz <= 0.0 || target_hz <= 0.0 {
                    return 0;
                }
                (source_len as f64 * (target_hz / source_hz)).floor() as usize
            }
        }
    }
}

impl Default for TargetLength {
    fn default() -> Self {
        TargetLength::Fixed(25)
    }
}

/// Numeric channels a window carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    GyroX,
    GyroY,
    GyroZ,
    Temperature,
}

/// Fixed-length multichannel window handed to inference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Window {
    pub id: Uuid,

    /// Copied from the first source sample
    pub device_id: String,

    /// Session label (dataset collection), None for live inference
    pub label: Option<u32>,

    /// Number of samples the window was built from
    pub source_len: usize,

    /// Device clock, rounded to whole milliseconds, non-decreasing
    pub timestamps_ms: Vec<i64>,

    pub gyro_x: Vec<f64>,
    pub gyro_y: Vec<f64>,
    pub gyro_z: Vec<f64>,

    /// Present only when every source sample carried a temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Vec<f64>>,
}

/// One entry of the persisted window output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRecord {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "gyX")]
    pub gy_x: f64,
    #[serde(rename = "gyY")]
    pub gy_y: f64,
    #[serde(rename = "gyZ")]
    pub gy_z: f64,
    pub label: Option<u32>,
}

impl Window {
    pub fn len(&self) -> usize {
        self.gyro_x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gyro_x.is_empty()
    }

    pub fn start_ms(&self) -> i64 {
        self.timestamps_ms.first().copied().unwrap_or(0)
    }

    pub fn end_ms(&self) -> i64 {
        self.timestamps_ms.last().copied().unwrap_or(0)
    }

    pub fn with_label(mut self, label: Option<u32>) -> Self {
        self.label = label;
        self
    }

    /// Values of one channel, None if the window lacks it
    pub fn channel(&self, channel: Channel) -> Option<&[f64]> {
        match channel {
            Channel::GyroX => Some(&self.gyro_x),
            Channel::GyroY => Some(&self.gyro_y),
            Channel::GyroZ => Some(&self.gyro_z),
            Channel::Temperature => self.temperature.as_deref(),
        }
    }

    /// Flatten into the `{ID, gyX, gyY, gyZ, label}` record list
    pub fn to_records(&self) -> Vec<WindowRecord> {
        (0..self.len())
            .map(|i| WindowRecord {
                id: self.device_id.clone(),
                gy_x: self.gyro_x[i],
                gy_y: self.gyro_y[i],
                gy_z: self.gyro_z[i],
                label: self.label,
            })
            .collect()
    }
}

/// Resample a sample sequence to exactly `target_len` points per channel
///
/// Both axes span `[0, len-1]`; the target axis has `target_len` evenly spaced
/// points. The first and last values of every channel are reproduced exactly,
/// and a sequence already `target_len` long is copied unchanged.
pub fn resample(samples: &[Sample], target_len: usize) -> Result<Window, ResampleError> {
    if target_len < 2 {
        return Err(ResampleError::InvalidTarget(target_len));
    }

    let device_id = match samples.first() {
        Some(first) if samples.len() >= 2 => first.device_id.clone(),
        _ => {
            return Err(ResampleError::InsufficientSamples {
                device_id: samples
                    .first()
                    .map(|s| s.device_id.clone())
                    .unwrap_or_default(),
                len: samples.len(),
            });
        }
    };

    let gyro_x: Vec<f64> = samples.iter().map(|s| s.gyro_x).collect();
    let gyro_y: Vec<f64> = samples.iter().map(|s| s.gyro_y).collect();
    let gyro_z: Vec<f64> = samples.iter().map(|s| s.gyro_z).collect();
    let temperature: Option<Vec<f64>> = samples.iter().map(|s| s.temperature).collect();

    if samples.len() == target_len {
        return Ok(Window {
            id: Uuid::new_v4(),
            device_id,
            label: None,
            source_len: samples.len(),
            timestamps_ms: samples.iter().map(|s| s.timestamp_ms).collect(),
            gyro_x,
            gyro_y,
            gyro_z,
            temperature,
        });
    }

    let timestamps: Vec<f64> = samples.iter().map(|s| s.timestamp_ms as f64).collect();

    Ok(Window {
        id: Uuid::new_v4(),
        device_id,
        label: None,
        source_len: samples.len(),
        timestamps_ms: interpolate(&timestamps, target_len)
            .into_iter()
            .map(|t| t.round() as i64)
            .collect(),
        gyro_x: interpolate(&gyro_x, target_len),
        gyro_y: interpolate(&gyro_y, target_len),
        gyro_z: interpolate(&gyro_z, target_len),
        temperature: temperature.map(|t| interpolate(&t, target_len)),
    })
}

// Requires values.len() >= 2 and target_len >= 2
fn interpolate(values: &[f64], target_len: usize) -> Vec<f64> {
    let last = values.len() - 1;
    let span = (target_len - 1) as f64;

    (0..target_len)
        .map(|j| {
            let x = j as f64 * last as f64 / span;
            let i = (x.floor() as usize).min(last - 1);
            let t = x - i as f64;
            // a*(1-t) + b*t hits both endpoints exactly
            values[i] * (1.0 - t) + values[i + 1] * t
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples_from(xs: &[f64]) -> Vec<Sample> {
        xs.iter()
            .enumerate()
            .map(|(i, &x)| Sample::new("wrist", i as i64 * 50, x, -x, x * 2.0))
            .collect()
    }

    #[test]
    fn test_upsample_single_channel_scenario() {
        let samples = samples_from(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        let window = resample(&samples, 9).unwrap();

        assert_eq!(
            window.gyro_x,
            vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0]
        );
    }

    #[test]
    fn test_every_channel_has_target_length() {
        let samples: Vec<Sample> = samples_from(&[0.3, -1.7, 2.9, 0.01, 5.5, -0.4, 1.1])
            .into_iter()
            .map(|s| s.with_temperature(30.0))
            .collect();

        for n in [2, 3, 7, 25, 100, 120] {
            let window = resample(&samples, n).unwrap();
            assert_eq!(window.len(), n);
            assert_eq!(window.gyro_y.len(), n);
            assert_eq!(window.gyro_z.len(), n);
            assert_eq!(window.timestamps_ms.len(), n);
            assert_eq!(window.temperature.as_ref().unwrap().len(), n);
        }
    }

    #[test]
    fn test_endpoints_are_preserved() {
        let xs = [0.1, 0.7, -3.3, 2.2, 9.81, -0.07];
        let samples = samples_from(&xs);

        for n in [2, 4, 11, 25, 97] {
            let window = resample(&samples, n).unwrap();
            assert_eq!(window.gyro_x[0], 0.1);
            assert_eq!(window.gyro_x[n - 1], -0.07);
            assert_eq!(window.gyro_y[0], -0.1);
            assert_eq!(window.gyro_y[n - 1], 0.07);
            assert_eq!(window.timestamps_ms[0], 0);
            assert_eq!(window.timestamps_ms[n - 1], 250);
        }
    }

    #[test]
    fn test_matching_length_is_identity() {
        let xs = [0.1, 0.7, -3.3, 2.2];
        let samples = samples_from(&xs);
        let window = resample(&samples, 4).unwrap();

        assert_eq!(window.gyro_x, xs.to_vec());
        assert_eq!(window.timestamps_ms, vec![0, 50, 100, 150]);
        assert_eq!(window.source_len, 4);
    }

    #[test]
    fn test_downsample_interpolates() {
        let samples = samples_from(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let window = resample(&samples, 3).unwrap();

        assert_eq!(window.gyro_x, vec![0.0, 3.0, 6.0]);
    }

    #[test]
    fn test_single_sample_is_insufficient() {
        let samples = samples_from(&[1.0]);
        match resample(&samples, 25) {
            Err(ResampleError::InsufficientSamples { device_id, len }) => {
                assert_eq!(device_id, "wrist");
                assert_eq!(len, 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        assert!(matches!(
            resample(&[], 25),
            Err(ResampleError::InsufficientSamples { len: 0, .. })
        ));
    }

    #[test]
    fn test_target_below_two_rejected() {
        let samples = samples_from(&[1.0, 2.0, 3.0]);
        assert!(matches!(resample(&samples, 1), Err(ResampleError::InvalidTarget(1))));
    }

    #[test]
    fn test_timestamps_rounded_and_non_decreasing() {
        let samples = vec![
            Sample::new("w", 1000, 0.0, 0.0, 0.0),
            Sample::new("w", 1003, 0.0, 0.0, 0.0),
            Sample::new("w", 1003, 0.0, 0.0, 0.0),
            Sample::new("w", 1010, 0.0, 0.0, 0.0),
        ];
        let window = resample(&samples, 10).unwrap();

        assert_eq!(window.start_ms(), 1000);
        assert_eq!(window.end_ms(), 1010);
        assert!(window.timestamps_ms.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_device_id_copied_not_interpolated() {
        let mut samples = samples_from(&[0.0, 1.0, 2.0]);
        samples[2].device_id = "other".to_string();
        let window = resample(&samples, 5).unwrap();

        assert_eq!(window.device_id, "wrist");
        assert!(window.to_records().iter().all(|r| r.id == "wrist"));
    }

    #[test]
    fn test_temperature_dropped_when_incomplete() {
        let mut samples = samples_from(&[0.0, 1.0, 2.0]);
        samples[0].temperature = Some(30.0);
        let window = resample(&samples, 5).unwrap();

        assert!(window.temperature.is_none());
        assert!(window.channel(Channel::Temperature).is_none());
        assert_eq!(window.channel(Channel::GyroZ).unwrap().len(), 5);
    }

    #[test]
    fn test_scaled_target_resolves_from_rates() {
        let target = TargetLength::Scaled {
            source_hz: 20.0,
            target_hz: 100.0,
        };
        assert_eq!(target.resolve(24), 120);
        assert_eq!(TargetLength::Fixed(25).resolve(7), 25);
    }

    #[test]
    fn test_records_carry_label() {
        let samples = samples_from(&[0.0, 2.0]);
        let window = resample(&samples, 3).unwrap().with_label(Some(2));
        let records = window.to_records();

        assert_eq!(records.len(), 3);
        assert_eq!(records[1].gy_x, 1.0);
        assert_eq!(records[1].label, Some(2));

        let json = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(json["ID"], "wrist");
        assert_eq!(json["gyX"], 0.0);
        assert_eq!(json["label"], 2);
    }
}
