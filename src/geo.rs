//! Planar distance approximation.
//!
//! One constant for both axes. Over-estimates east-west distance away
//! from the equator, which matches the behavior clients already depend
//! on for nearby-result sets.

/// Kilometres per degree of latitude (and, approximately, longitude).
pub const KM_PER_DEGREE: f64 = 111.0;

/// Planar distance between two coordinates in kilometres.
#[inline]
pub fn planar_distance_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let dlat = (lat2 - lat1) * KM_PER_DEGREE;
    let dlng = (lng2 - lng1) * KM_PER_DEGREE;
    (dlat * dlat + dlng * dlng).sqrt()
}

/// Planar distance in metres.
#[inline]
pub fn planar_distance_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    planar_distance_km(lat1, lng1, lat2, lng2) * 1000.0
}

/// Half-width in degrees of a bounding box that contains every point
/// within `radius_km`, used to prefilter candidates before the exact check.
#[inline]
pub fn degrees_for_km(radius_km: f64) -> f64 {
    radius_km / KM_PER_DEGREE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_for_identical_points() {
        assert_eq!(planar_distance_km(12.97, 77.59, 12.97, 77.59), 0.0);
    }

    #[test]
    fn one_degree_of_latitude_is_111_km() {
        let d = planar_distance_km(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111.0).abs() < 1e-9);
    }

    #[test]
    fn diagonal_combines_both_axes() {
        let d = planar_distance_km(0.0, 0.0, 3.0, 4.0);
        assert!((d - 5.0 * 111.0).abs() < 1e-9);
    }

    #[test]
    fn metres_scale_from_km() {
        // ~0.001 deg of latitude is ~111 m.
        let m = planar_distance_m(0.0, 0.0, 0.001, 0.0);
        assert!((m - 111.0).abs() < 1e-6);
    }
}
