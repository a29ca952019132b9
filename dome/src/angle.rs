//! Azimuth arithmetic
//!
//! Every azimuth stored by the dome core is normalized to `[0, 360)`.
//! Callers may pass any finite value; the controllers normalize on entry.

/// Direction of dome rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RotationDirection {
    Clockwise,
    CounterClockwise,
}

impl RotationDirection {
    /// The opposite direction
    pub fn reversed(self) -> Self {
        match self {
            RotationDirection::Clockwise => RotationDirection::CounterClockwise,
            RotationDirection::CounterClockwise => RotationDirection::Clockwise,
        }
    }
}

/// Normalize an azimuth to `[0, 360)`.
pub fn normalize_azimuth(azimuth: f64) -> f64 {
    let normalized = azimuth.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if normalized >= 360.0 {
        0.0
    } else {
        normalized
    }
}

/// Signed shortest-path delta from `from` to `to`, in `[-180, 180]`.
///
/// Positive values mean clockwise travel.
pub fn shortest_path(from: f64, to: f64) -> f64 {
    let mut diff = normalize_azimuth(to) - normalize_azimuth(from);
    if diff > 180.0 {
        diff -= 360.0;
    } else if diff < -180.0 {
        diff += 360.0;
    }
    diff
}

/// Unsigned angular distance between two azimuths, in `[0, 180]`.
pub fn angular_distance(a: f64, b: f64) -> f64 {
    shortest_path(a, b).abs()
}

/// Shortest path from `from` to `to` as a distance and direction.
pub fn shortest_path_with_direction(from: f64, to: f64) -> (f64, RotationDirection) {
    let delta = shortest_path(from, to);
    if delta >= 0.0 {
        (delta, RotationDirection::Clockwise)
    } else {
        (-delta, RotationDirection::CounterClockwise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_range() {
        for x in [-1080.5, -360.0, -0.0001, 0.0, 1.0, 359.999, 360.0, 725.0, 1e6] {
            let n = normalize_azimuth(x);
            assert!((0.0..360.0).contains(&n), "{} -> {}", x, n);
        }
        assert_eq!(normalize_azimuth(360.0), 0.0);
        assert_eq!(normalize_azimuth(-90.0), 270.0);
        assert_eq!(normalize_azimuth(450.0), 90.0);
    }

    #[test]
    fn test_normalize_periodic() {
        for x in [0.0, 12.5, 90.0, 181.25, 359.0] {
            for k in -3..=3 {
                let shifted = x + 360.0 * k as f64;
                assert!((normalize_azimuth(shifted) - normalize_azimuth(x)).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_shortest_path_wraps() {
        assert_eq!(shortest_path(350.0, 10.0), 20.0);
        assert_eq!(shortest_path(10.0, 350.0), -20.0);
        assert_eq!(shortest_path(90.0, 95.0), 5.0);
        assert!((angular_distance(359.5, 0.2) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_shortest_path_symmetry() {
        let samples = [0.0, 1.0, 45.0, 179.0, 181.0, 270.0, 359.9];
        for &a in &samples {
            for &b in &samples {
                let ab = shortest_path(a, b);
                let ba = shortest_path(b, a);
                assert!(ab.abs() <= 180.0);
                assert!((ab + ba).abs() < 1e-9, "{} {} -> {} {}", a, b, ab, ba);
            }
        }
    }

    #[test]
    fn test_direction() {
        assert_eq!(
            shortest_path_with_direction(0.0, 90.0),
            (90.0, RotationDirection::Clockwise)
        );
        assert_eq!(
            shortest_path_with_direction(0.0, 270.0),
            (90.0, RotationDirection::CounterClockwise)
        );
        assert_eq!(RotationDirection::Clockwise.reversed(), RotationDirection::CounterClockwise);
    }
}
