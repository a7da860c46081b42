//! Sensor windows and feature extraction.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A fixed-size slice of raw samples, row-major (`samples × channels`).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Window {
    /// Capture time of the last sample, seconds since the Unix epoch.
    pub timestamp: f64,
    pub channels: usize,
    pub samples: Vec<f32>,
}

impl Window {
    pub fn len(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples of one channel in time order.
    pub fn channel(&self, c: usize) -> impl Iterator<Item = f32> + '_ {
        self.samples
            .iter()
            .skip(c)
            .step_by(self.channels.max(1))
            .copied()
    }
}

/// Maps a raw window to the vector the classifier consumes. Pure.
pub trait FeatureExtractor: Send + Sync {
    /// Output width for a window with `channels` channels.
    fn feature_dim(&self, channels: usize) -> usize;

    fn extract(&self, window: &Window) -> Vec<f32>;
}

/// Hudgins time-domain set, per channel: mean absolute value, root mean
/// square, waveform length, zero crossings and slope sign changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeDomainFeatures {
    /// Minimum step for a zero crossing / slope change to count.
    pub threshold: f32,
}

impl Default for TimeDomainFeatures {
    fn default() -> Self {
        Self { threshold: 0.0 }
    }
}

const TD_PER_CHANNEL: usize = 5;

impl FeatureExtractor for TimeDomainFeatures {
    fn feature_dim(&self, channels: usize) -> usize {
        channels * TD_PER_CHANNEL
    }

    fn extract(&self, window: &Window) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.feature_dim(window.channels));
        let n = window.len();
        for c in 0..window.channels {
            let x: Vec<f32> = window.channel(c).collect();
            if n == 0 {
                out.extend([0.0; TD_PER_CHANNEL]);
                continue;
            }
            let mav = x.iter().map(|v| v.abs()).sum::<f32>() / n as f32;
            let rms = (x.iter().map(|v| v * v).sum::<f32>() / n as f32).sqrt();
            let wl: f32 = x.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
            let zc = x
                .windows(2)
                .filter(|w| w[0] * w[1] < 0.0 && (w[0] - w[1]).abs() >= self.threshold)
                .count();
            let ssc = x
                .windows(3)
                .filter(|w| {
                    let d1 = w[1] - w[0];
                    let d2 = w[1] - w[2];
                    d1 * d2 > 0.0 && (d1.abs() >= self.threshold || d2.abs() >= self.threshold)
                })
                .count();
            out.extend([mav, rms, wl, zc as f32, ssc as f32]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn td_features_on_square_wave() {
        // Two channels: ch0 alternates ±1, ch1 is a constant 2.
        let mut samples = Vec::new();
        for i in 0..8 {
            samples.push(if i % 2 == 0 { 1.0 } else { -1.0 });
            samples.push(2.0);
        }
        let w = Window {
            timestamp: 0.0,
            channels: 2,
            samples,
        };
        let td = TimeDomainFeatures::default();
        let f = td.extract(&w);
        assert_eq!(f.len(), td.feature_dim(2));
        assert_eq!(&f[..5], &[1.0, 1.0, 14.0, 7.0, 6.0]);
        assert_eq!(&f[5..], &[2.0, 2.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn threshold_suppresses_small_crossings() {
        let w = Window {
            timestamp: 0.0,
            channels: 1,
            samples: vec![0.01, -0.01, 0.01, -0.01],
        };
        let f = TimeDomainFeatures { threshold: 0.5 }.extract(&w);
        assert_eq!(f[3], 0.0);
        assert_eq!(f[4], 0.0);
    }

    #[test]
    fn empty_window_yields_zeros() {
        let w = Window {
            timestamp: 0.0,
            channels: 3,
            samples: vec![],
        };
        assert_eq!(TimeDomainFeatures::default().extract(&w), vec![0.0; 15]);
    }
}
