use crate::cache::ValueCache;
use crate::channels::{Channel, Descriptor, Registry};
use crate::convert;
use tracing::{debug, trace};

/// Variables feeding the heat recovery efficiency calculation:
/// inside, outside, exhaust, incoming.
pub const TEMPERATURE_VARIABLES: [u8; 4] = [0x34, 0x32, 0x33, 0x35];
/// High and low byte of the measured CO2 concentration.
pub const CO2_VARIABLES: [u8; 2] = [0x2B, 0x2C];
/// High and low byte of the CO2 set point.
pub const CO2_SETPOINT_VARIABLES: [u8; 2] = [0xB3, 0xB4];

/// A decoded channel value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Switch(bool),
    Number(i64),
    Decimal(f64),
    /// A composite whose halves are not all cached yet.
    Undefined,
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::Switch(true) => f.write_str("ON"),
            Value::Switch(false) => f.write_str("OFF"),
            Value::Number(n) => f.write_fmt(format_args!("{n}")),
            Value::Decimal(n) => f.write_fmt(format_args!("{n}")),
            Value::Undefined => f.write_str("UNDEF"),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::Switch(b) => serializer.serialize_bool(b),
            Value::Number(n) => serializer.serialize_i64(n),
            Value::Decimal(n) => serializer.serialize_f64(n),
            Value::Undefined => serializer.serialize_none(),
        }
    }
}

/// Decode one raw byte according to the channel's descriptor.
///
/// Multi-value bytes decode to their raw value; use [`variable_updated`] to
/// fan them out. Engine-computed channels have no byte form and decode to
/// [`Value::Undefined`].
pub fn decode(channel: Channel, raw: u8) -> Value {
    match channel.descriptor() {
        Descriptor::Boolean { mask, .. } => Value::Switch(raw & mask != 0),
        Descriptor::Masked { mask, .. } => Value::Number(i64::from(raw & mask)),
        Descriptor::Integer { .. } | Descriptor::Multi { .. } => Value::Number(i64::from(raw)),
        Descriptor::Temperature { .. } => Value::Number(i64::from(convert::temperature_to_int(raw))),
        Descriptor::FanSpeed { .. } => Value::Number(i64::from(convert::fan_speed_to_int(raw))),
        Descriptor::Humidity { .. } => Value::Number(i64::from(convert::humidity_to_int(raw))),
        Descriptor::Virtual => Value::Undefined,
    }
}

/// Channel updates caused by a freshly cached variable byte.
///
/// The cache must already hold the new value. Pure function of the cache
/// state and the variable, dispatching on the channel descriptor.
pub fn variable_updated(
    registry: &Registry,
    variable: u8,
    cache: &ValueCache,
) -> Vec<(Channel, Value)> {
    let Some(raw) = cache.get(variable) else {
        debug!(
            message = "updated variable missing from cache",
            variable = format_args!("{variable:02X}")
        );
        return Vec::new();
    };
    let Some(channel) = registry.channel_for_variable(variable) else {
        trace!(
            message = "no channel for variable",
            variable = format_args!("{variable:02X}")
        );
        return Vec::new();
    };

    let mut updates = Vec::new();
    match registry.describe(channel) {
        Descriptor::Multi { subs, .. } => {
            for &sub in subs {
                updates.push((sub, decode(sub, raw)));
            }
        }
        Descriptor::Temperature { .. } => {
            updates.push((channel, decode(channel, raw)));
            calculate_efficiencies(cache, &mut updates);
        }
        _ if channel == Channel::Co2High || channel == Channel::Co2Low => {
            updates.push((Channel::Co2, merge_pair(cache, CO2_VARIABLES)));
        }
        _ if channel == Channel::Co2SetPointHigh || channel == Channel::Co2SetPointLow => {
            updates.push((Channel::Co2SetPoint, merge_pair(cache, CO2_SETPOINT_VARIABLES)));
        }
        _ => updates.push((channel, decode(channel, raw))),
    }
    trace!(message = "channels decoded from variable", count = updates.len());
    updates
}

/// Heat recovery efficiencies as specified by the vendor. Needs all four
/// temperatures; a non-positive inside/outside spread means the exchanger
/// cannot be measured and reads as 100 %.
fn calculate_efficiencies(cache: &ValueCache, updates: &mut Vec<(Channel, Value)>) {
    if !cache.has_all_of(&TEMPERATURE_VARIABLES) {
        return;
    }
    let [inside, outside, exhaust, incoming] = TEMPERATURE_VARIABLES.map(|variable| {
        // Guarded by has_all_of above.
        i32::from(convert::temperature_to_int(cache.get(variable).unwrap_or_default()))
    });
    let max_possible = inside - outside;
    if max_possible <= 0 {
        updates.push((Channel::InEfficiency, Value::Decimal(100.0)));
        updates.push((Channel::OutEfficiency, Value::Decimal(100.0)));
        updates.push((Channel::AverageEfficiency, Value::Decimal(100.0)));
        return;
    }
    let in_efficiency = f64::from(incoming - outside) * 100.0 / f64::from(max_possible);
    let out_efficiency = f64::from(inside - exhaust) * 100.0 / f64::from(max_possible);
    updates.push((Channel::InEfficiency, Value::Decimal(in_efficiency)));
    updates.push((Channel::OutEfficiency, Value::Decimal(out_efficiency)));
    updates.push((
        Channel::AverageEfficiency,
        Value::Decimal((in_efficiency + out_efficiency) / 2.0),
    ));
}

/// Big-endian 16-bit value from a cached high/low byte pair, or the explicit
/// undefined marker while one half is still missing.
fn merge_pair(cache: &ValueCache, [high, low]: [u8; 2]) -> Value {
    if !cache.has_all_of(&[high, low]) {
        debug!(
            message = "composite half missing, value undefined",
            high = format_args!("{high:02X}"),
            low = format_args!("{low:02X}")
        );
        return Value::Undefined;
    }
    let high = u16::from(cache.get(high).unwrap_or_default());
    let low = u16::from(cache.get(low).unwrap_or_default());
    Value::Number(i64::from((high << 8) | low))
}
