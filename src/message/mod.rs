//! Decoders for the two characteristic payloads the sensor publishes

mod fuel_usage_message;
mod run_counter_message;

pub use fuel_usage_message::{decode_fuel_usage, FUEL_USAGE_LEN};
pub use run_counter_message::{decode_run_counter, RUN_COUNTER_LEN};
