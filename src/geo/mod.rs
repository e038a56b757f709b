use crate::models::driver::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;
/// Widens every box edge so float rounding never excludes a point that
/// `distance_km` places exactly on the radius.
const BOX_PADDING_DEGREES: f64 = 1e-6;

pub const DEFAULT_SPEED_KMH: f64 = 30.0;
pub const DEFAULT_BUFFER_FACTOR: f64 = 1.2;

pub fn distance_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lng = (lng2 - lng1).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + phi1.cos() * phi2.cos() * sin_lng * sin_lng;
    // Rounding can push the term a hair past 1.0 for antipodal points.
    let central_angle = 2.0 * haversine.clamp(0.0, 1.0).sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    distance_km(a.lat, a.lng, b.lat, b.lng)
}

/// Straight-line travel time in whole minutes.
///
/// Rounds up twice: once when converting hours to minutes and again after
/// the buffer factor is applied. Collapsing this into a single rounding
/// changes results, so keep both passes.
pub fn estimate_travel_minutes(distance_km: f64, speed_kmh: f64, buffer_factor: f64) -> u32 {
    if !distance_km.is_finite() || distance_km <= 0.0 || speed_kmh <= 0.0 {
        return 0;
    }

    let raw_minutes = (distance_km / speed_kmh * 60.0).ceil();
    (raw_minutes * buffer_factor.max(0.0)).ceil() as u32
}

/// Axis-aligned lat/lng box enclosing a circle, used to narrow store
/// queries before exact distance filtering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    /// Smallest box holding every point within `radius_km` great-circle
    /// distance of `center`, on the same sphere as [`distance_km`].
    pub fn around(center: &GeoPoint, radius_km: f64) -> Self {
        let angular = radius_km.max(0.0) / EARTH_RADIUS_KM;
        if angular >= std::f64::consts::PI {
            return Self::world();
        }

        let lat_delta = angular.to_degrees() + BOX_PADDING_DEGREES;
        let min_lat = (center.lat - lat_delta).max(-90.0);
        let max_lat = (center.lat + lat_delta).min(90.0);

        // Widest longitude reach of the circle is asin(sin(d/R) / cos(lat)).
        // When the circle covers a pole every longitude is reachable.
        let cos_lat = center.lat.to_radians().cos();
        let sin_angular = angular.sin();
        let touches_pole = max_lat >= 90.0 || min_lat <= -90.0 || sin_angular >= cos_lat;
        if touches_pole {
            return Self {
                min_lat,
                max_lat,
                min_lng: -180.0,
                max_lng: 180.0,
            };
        }

        let lng_delta = (sin_angular / cos_lat).asin().to_degrees() + BOX_PADDING_DEGREES;
        let wraps = center.lng - lng_delta < -180.0 || center.lng + lng_delta > 180.0;
        let (min_lng, max_lng) = if wraps {
            (-180.0, 180.0)
        } else {
            (center.lng - lng_delta, center.lng + lng_delta)
        };

        Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        }
    }

    fn world() -> Self {
        Self {
            min_lat: -90.0,
            max_lat: 90.0,
            min_lng: -180.0,
            max_lng: 180.0,
        }
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.lat >= self.min_lat
            && point.lat <= self.max_lat
            && point.lng >= self.min_lng
            && point.lng <= self.max_lng
    }
}

pub fn is_valid_coordinate(lat: f64, lng: f64) -> bool {
    lat.is_finite()
        && lng.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lng)
}
