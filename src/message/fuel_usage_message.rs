use crate::error::FuelError;
use tracing::trace;

/// Exact width of the fuel usage payload
pub const FUEL_USAGE_LEN: usize = 8;

/// Decode the fuel usage characteristic into liters used this trip.
///
/// The payload is a little-endian 64 bit pattern which is then reinterpreted
/// as an IEEE-754 double. Both steps are kept separate so that the bit
/// pattern survives unchanged, NaN payloads included.
pub fn decode_fuel_usage(data: &[u8]) -> Result<f64, FuelError> {
    let bytes: [u8; FUEL_USAGE_LEN] = data.try_into().map_err(|_| FuelError::InvalidLength {
        expected: FUEL_USAGE_LEN,
        actual: data.len(),
    })?;

    let bit_pattern = u64::from_le_bytes(bytes);
    let liters = f64::from_bits(bit_pattern);
    trace!("fuel usage 0x{} -> {liters} L", hex::encode(data));
    Ok(liters)
}
