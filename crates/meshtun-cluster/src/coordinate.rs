//! Vivaldi-style network coordinates
//!
//! Each node maintains a point in a small Euclidean space plus a
//! non-Euclidean height. The distance between two points approximates the
//! round-trip time between the nodes. Coordinates are only ever used for
//! ordering peers by closeness, never as an absolute latency estimate.

use serde::{Deserialize, Serialize};

const DIMENSIONS: usize = 4;

/// Fraction of the prediction error corrected per observation.
const ADJUSTMENT_CC: f64 = 0.25;
/// Smoothing factor for the local error estimate.
const ERROR_CE: f64 = 0.25;
/// Floor for the height component, in seconds.
const MIN_HEIGHT: f64 = 10.0e-6;

/// A network coordinate: a point in coordinate space plus a height that
/// models the access-link cost shared by all paths from the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkCoordinate {
    vec: [f64; DIMENSIONS],
    height: f64,
    error: f64,
}

impl Default for NetworkCoordinate {
    fn default() -> Self {
        NetworkCoordinate {
            vec: [0.0; DIMENSIONS],
            height: MIN_HEIGHT,
            error: 1.5,
        }
    }
}

impl NetworkCoordinate {
    /// Predicted round-trip time to the other coordinate, in seconds.
    /// Always nonnegative.
    pub fn distance_to(&self, other: &NetworkCoordinate) -> f64 {
        let mut sum = 0.0;
        for i in 0..DIMENSIONS {
            let d = self.vec[i] - other.vec[i];
            sum += d * d;
        }
        sum.sqrt() + self.height + other.height
    }

    /// Move this coordinate toward or away from `other` so that the
    /// predicted distance tracks the observed round-trip time.
    pub fn observe_rtt(&mut self, rtt_secs: f64, other: &NetworkCoordinate) {
        if !rtt_secs.is_finite() || rtt_secs <= 0.0 {
            return;
        }

        let dist = self.distance_to(other);
        let error = rtt_secs - dist;

        // Weight the correction by how confident we are relative to the
        // remote node.
        let total_error = (self.error + other.error).max(f64::MIN_POSITIVE);
        let weight = self.error / total_error;

        let rel_error = (error / rtt_secs).abs();
        self.error = (rel_error * ERROR_CE * weight + self.error * (1.0 - ERROR_CE * weight))
            .clamp(f64::MIN_POSITIVE, 10.0);

        let force = ADJUSTMENT_CC * weight * error;
        let (unit, norm) = self.unit_vector_to(other);
        for i in 0..DIMENSIONS {
            self.vec[i] += unit[i] * force;
        }
        // When the points coincide the whole correction lands on the height.
        let height_share = if norm > 0.0 {
            (self.height + other.height) / dist
        } else {
            1.0
        };
        self.height = (self.height + force * height_share).max(MIN_HEIGHT);
    }

    fn unit_vector_to(&self, other: &NetworkCoordinate) -> ([f64; DIMENSIONS], f64) {
        let mut diff = [0.0; DIMENSIONS];
        let mut norm = 0.0;
        for i in 0..DIMENSIONS {
            diff[i] = self.vec[i] - other.vec[i];
            norm += diff[i] * diff[i];
        }
        let norm = norm.sqrt();
        if norm > 0.0 {
            for d in diff.iter_mut() {
                *d /= norm;
            }
        }
        (diff, norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_nonnegative_and_symmetric_at_rest() {
        let a = NetworkCoordinate::default();
        let b = NetworkCoordinate::default();
        let d = a.distance_to(&b);
        assert!(d >= 0.0);
        assert!((d - b.distance_to(&a)).abs() < 1e-12);
    }

    #[test]
    fn observations_converge_toward_measured_rtt() {
        let mut a = NetworkCoordinate::default();
        let b = NetworkCoordinate::default();

        let rtt = 0.080;
        for _ in 0..64 {
            a.observe_rtt(rtt, &b);
        }

        let predicted = a.distance_to(&b);
        assert!(
            (predicted - rtt).abs() < rtt * 0.5,
            "predicted {predicted} too far from {rtt}"
        );
    }

    #[test]
    fn bogus_rtt_observations_are_ignored() {
        let mut a = NetworkCoordinate::default();
        let b = NetworkCoordinate::default();
        let before = a.clone();

        a.observe_rtt(0.0, &b);
        a.observe_rtt(-1.0, &b);
        a.observe_rtt(f64::NAN, &b);

        assert_eq!(a, before);
    }
}
