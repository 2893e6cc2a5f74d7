use tracing::debug;

use crate::{
    error::DispatchError,
    geo::haversine_km,
    models::{Bounds, Device, FilterSpec, GeoRadius},
};

/// Returns the devices matching every predicate present in `spec`, in their
/// original order.
pub fn apply(devices: Vec<Device>, spec: &FilterSpec) -> Vec<Device> {
    let total = devices.len();
    let matched: Vec<Device> = devices
        .into_iter()
        .filter(|device| matches(device, spec))
        .collect();

    debug!(
        total,
        matched = matched.len(),
        "Applied device filter"
    );

    matched
}

pub fn matches(device: &Device, spec: &FilterSpec) -> bool {
    let profile = &device.profile;

    if let Some(gender) = spec.gender.as_deref().filter(|g| !g.is_empty()) {
        if profile.gender.as_deref() != Some(gender) {
            return false;
        }
    }

    if let Some(min) = spec.age_min {
        match profile.age {
            Some(age) if age >= min => {}
            _ => return false,
        }
    }

    if let Some(max) = spec.age_max {
        match profile.age {
            Some(age) if age <= max => {}
            _ => return false,
        }
    }

    if let Some(interests) = spec.interests.as_ref().filter(|i| !i.is_empty()) {
        if profile.interests.is_disjoint(interests) {
            return false;
        }
    }

    if let Some(radius) = &spec.location {
        if !within_radius(device, radius) {
            return false;
        }
    }

    if let Some(bounds) = &spec.bounds {
        if !within_bounds(device, bounds) {
            return false;
        }
    }

    true
}

fn within_radius(device: &Device, radius: &GeoRadius) -> bool {
    match device.profile.location {
        Some(loc) => haversine_km(radius.lat, radius.lng, loc.lat, loc.lng) <= radius.radius_km,
        None => false,
    }
}

fn within_bounds(device: &Device, bounds: &Bounds) -> bool {
    match device.profile.location {
        Some(loc) => {
            loc.lat >= bounds.south
                && loc.lat <= bounds.north
                && loc.lng >= bounds.west
                && loc.lng <= bounds.east
        }
        None => false,
    }
}

/// Rejects specs that can never be evaluated meaningfully.
pub fn validate(spec: &FilterSpec) -> Result<(), DispatchError> {
    if let (Some(min), Some(max)) = (spec.age_min, spec.age_max) {
        if min > max {
            return Err(DispatchError::Validation(format!(
                "ageMin ({}) must not exceed ageMax ({})",
                min, max
            )));
        }
    }

    if let Some(radius) = &spec.location {
        validate_coordinate(radius.lat, radius.lng)?;
        if !(radius.radius_km > 0.0) {
            return Err(DispatchError::Validation(
                "location.radiusKm must be positive".to_string(),
            ));
        }
    }

    if let Some(bounds) = &spec.bounds {
        validate_bounds(bounds)?;
    }

    Ok(())
}

pub fn validate_bounds(bounds: &Bounds) -> Result<(), DispatchError> {
    validate_coordinate(bounds.north, bounds.east)?;
    validate_coordinate(bounds.south, bounds.west)?;

    if bounds.south > bounds.north {
        return Err(DispatchError::Validation(
            "bounds.south must not exceed bounds.north".to_string(),
        ));
    }
    if bounds.west > bounds.east {
        return Err(DispatchError::Validation(
            "bounds.west must not exceed bounds.east".to_string(),
        ));
    }

    Ok(())
}

pub fn validate_coordinate(lat: f64, lng: f64) -> Result<(), DispatchError> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(DispatchError::Validation(format!(
            "latitude {} out of range",
            lat
        )));
    }
    if !(-180.0..=180.0).contains(&lng) {
        return Err(DispatchError::Validation(format!(
            "longitude {} out of range",
            lng
        )));
    }
    Ok(())
}
