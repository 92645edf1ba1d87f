//! Utility functions for the fluxmon-ble crate.

/// Convert liters to US gallons.
///
/// # Arguments
///
/// * `liters` - Volume in liters
///
/// # Returns
///
/// Volume in US gallons
///
/// # Example
///
/// ```
/// use fluxmon_ble::liters_to_gallons;
///
/// let gallons = liters_to_gallons(3.785412);
/// assert!((gallons - 1.0).abs() < 0.001);
/// ```
#[inline]
pub fn liters_to_gallons(liters: f64) -> f64 {
    liters / 3.785412
}

/// Convert US gallons to liters.
///
/// # Arguments
///
/// * `gallons` - Volume in US gallons
///
/// # Returns
///
/// Volume in liters
///
/// # Example
///
/// ```
/// use fluxmon_ble::gallons_to_liters;
///
/// let liters = gallons_to_liters(1.0);
/// assert!((liters - 3.785412).abs() < 0.001);
/// ```
#[inline]
pub fn gallons_to_liters(gallons: f64) -> f64 {
    gallons * 3.785412
}

/// Convert liters per minute to liters per hour.
///
/// # Example
///
/// ```
/// use fluxmon_ble::lpm_to_lph;
///
/// assert!((lpm_to_lph(0.5) - 30.0).abs() < 0.001);
/// ```
#[inline]
pub fn lpm_to_lph(liters_per_minute: f64) -> f64 {
    liters_per_minute * 60.0
}

/// Format a reading with three decimal places, the precision the meter
/// firmware reports.
///
/// # Example
///
/// ```
/// use fluxmon_ble::format_reading;
///
/// assert_eq!(format_reading(12.34), "12.340");
/// ```
#[inline]
pub fn format_reading(value: f32) -> String {
    format!("{:.3}", value)
}
