use crate::error::FuelError;
use tracing::trace;

/// Width of the run counter as the sensor stores it
pub const RUN_COUNTER_LEN: usize = 8;

/// Decode the run counter characteristic.
///
/// The sensor writes its counter in host byte order and the value is taken
/// exactly as delivered, without swapping. Only the first eight bytes are
/// looked at; anything after them is ignored. A payload too short to hold a
/// counter is rejected rather than padded.
pub fn decode_run_counter(data: &[u8]) -> Result<u64, FuelError> {
    let bytes: [u8; RUN_COUNTER_LEN] = data
        .get(..RUN_COUNTER_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(FuelError::InvalidLength {
            expected: RUN_COUNTER_LEN,
            actual: data.len(),
        })?;

    let count = u64::from_ne_bytes(bytes);
    trace!("run counter 0x{} -> {count}", hex::encode(data));
    Ok(count)
}
