//! Haversine great-circle distances.
//!
//! Two variants are exposed on purpose: taxi proximity queries historically
//! use a kilometre Earth radius while ride-radius checks and nearest-taxi
//! matching use a metre radius. The defaults built on top of them (1 km taxi
//! radius, 500 m shared-ride radius) assume those exact units, so the two
//! call sites are kept distinct instead of being unified.

const EARTH_RADIUS_KM: f64 = 6371.0;
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in kilometres.
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    EARTH_RADIUS_KM * haversine_angle(lat1, lon1, lat2, lon2)
}

/// Great-circle distance in metres.
pub fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    EARTH_RADIUS_M * haversine_angle(lat1, lon1, lat2, lon2)
}

/// Central angle between two coordinates in radians.
///
/// The intermediate is clamped to [0, 1] so identical and antipodal points
/// never feed a negative value into the square roots.
fn haversine_angle(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1_rad, lon1_rad) = (lat1.to_radians(), lon1.to_radians());
    let (lat2_rad, lon2_rad) = (lat2.to_radians(), lon2.to_radians());
    let dlat = lat2_rad - lat1_rad;
    let dlon = lon2_rad - lon1_rad;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = (sin_dlat * sin_dlat + lat1_rad.cos() * lat2_rad.cos() * sin_dlon * sin_dlon)
        .clamp(0.0, 1.0);
    2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}
