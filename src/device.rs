use crate::cache::ValueCache;
use crate::channels::{Channel, Descriptor, Registry};
use crate::connection::{Connection, Event};
use crate::convert;
use crate::engine::{self, Value};
use crate::telegram::FrameState;
use std::collections::BTreeSet;
use std::sync::Arc;
use strum::IntoEnumIterator as _;
use tracing::trace;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("channel {0} is computed and cannot be written")]
    NotWritable(Channel),
    #[error("`{input}` is not a valid value for channel {channel}: {reason}")]
    BadValue { channel: Channel, input: String, reason: &'static str },
    #[error("no cached value for {0} yet, poll it before flipping bits in it")]
    NoCachedValue(Channel),
    #[error(transparent)]
    Connection(#[from] crate::connection::Error),
}

/// Protocol variables to poll so that `channel` gets a value.
///
/// The 16-bit composites need both halves, the efficiencies need all four
/// temperatures; everything else is its own variable.
pub fn poll_plan(registry: &Registry, channel: Channel) -> Vec<u8> {
    match channel {
        Channel::Co2 => engine::CO2_VARIABLES.to_vec(),
        Channel::Co2SetPoint => engine::CO2_SETPOINT_VARIABLES.to_vec(),
        Channel::InEfficiency | Channel::OutEfficiency | Channel::AverageEfficiency => {
            engine::TEMPERATURE_VARIABLES.to_vec()
        }
        _ => registry.variable_of(channel).into_iter().collect(),
    }
}

fn parse_switch(input: &str) -> Option<bool> {
    match input.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// `(variable, value)` command pairs that set `channel` to the given value.
///
/// Bit views read-modify-write their parent byte from the cache, so the
/// parent must have been polled first. The CO2 set point splits into its
/// high/low command pair.
pub fn write_plan(
    registry: &Registry,
    cache: &ValueCache,
    channel: Channel,
    input: &str,
) -> Result<Vec<(u8, u8)>, Error> {
    let bad = |reason| Error::BadValue { channel, input: input.to_string(), reason };
    match registry.describe(channel) {
        Descriptor::FanSpeed { variable } => {
            let speed = input.parse::<u8>().map_err(|_| bad("expected a speed number"))?;
            let byte =
                convert::fan_speed_to_byte(speed).ok_or_else(|| bad("fan speed is 1-8"))?;
            Ok(vec![(variable, byte)])
        }
        Descriptor::Temperature { variable } => {
            let celsius =
                input.parse::<i16>().map_err(|_| bad("expected degrees celsius"))?;
            Ok(vec![(variable, convert::temperature_to_byte(celsius))])
        }
        Descriptor::Humidity { variable } => {
            let percent = input.parse::<i16>().map_err(|_| bad("expected a percentage"))?;
            if !(0..=100).contains(&percent) {
                return Err(bad("humidity is 0-100"));
            }
            Ok(vec![(variable, convert::humidity_to_byte(percent))])
        }
        Descriptor::Integer { variable } => {
            let value = input.parse::<u8>().map_err(|_| bad("expected a byte value"))?;
            Ok(vec![(variable, value)])
        }
        Descriptor::Multi { variable, .. } => {
            let value = input.parse::<u8>().map_err(|_| bad("expected a raw byte value"))?;
            Ok(vec![(variable, value)])
        }
        Descriptor::Boolean { parent, mask } => {
            let on = parse_switch(input).ok_or_else(|| bad("expected on or off"))?;
            // Bit views always sit in a multi-value byte with a variable.
            let variable = registry.variable_of(parent).unwrap_or_default();
            let current = cache.get(variable).ok_or_else(|| Error::NoCachedValue(parent))?;
            let next = if on { current | mask } else { current & !mask };
            Ok(vec![(variable, next)])
        }
        Descriptor::Masked { parent, mask } => {
            let value = input.parse::<u8>().map_err(|_| bad("expected a number"))?;
            if value & !mask != 0 {
                return Err(bad("value does not fit the field"));
            }
            let variable = registry.variable_of(parent).unwrap_or_default();
            let current = cache.get(variable).ok_or_else(|| Error::NoCachedValue(parent))?;
            Ok(vec![(variable, (current & !mask) | value)])
        }
        Descriptor::Virtual => match channel {
            Channel::Co2SetPoint => {
                let target =
                    input.parse::<u16>().map_err(|_| bad("expected a ppm value"))?;
                let [high_variable, low_variable] = engine::CO2_SETPOINT_VARIABLES;
                let [high, low] = target.to_be_bytes();
                Ok(vec![(high_variable, high), (low_variable, low)])
            }
            _ => Err(Error::NotWritable(channel)),
        },
    }
}

/// Cache, registry and derived-value glue on top of one [`Connection`].
///
/// Feed every connection event through [`Device::handle_event`]; decoded
/// channel updates come back. Submitting polls and commands goes through the
/// channel-level helpers which know about composite values and bit views.
pub struct Device {
    connection: Arc<Connection>,
    registry: Registry,
    cache: ValueCache,
}

impl Device {
    pub fn new(registry: Registry, connection: Arc<Connection>) -> Self {
        Self { connection, registry, cache: ValueCache::new() }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cache(&self) -> &ValueCache {
        &self.cache
    }

    /// Call after reconnecting so stale values never feed derived channels.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn handle_event(&self, event: &Event) -> Vec<(Channel, Value)> {
        match event {
            Event::Telegram(telegram) if telegram.state == FrameState::Ok => {
                self.cache.put(telegram.variable(), telegram.value());
                engine::variable_updated(&self.registry, telegram.variable(), &self.cache)
            }
            Event::Telegram(telegram) => {
                trace!(
                    message = "telegram without channel updates",
                    details = telegram.state.details(),
                );
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    pub fn poll(&self, channel: Channel) -> Result<(), Error> {
        for variable in poll_plan(&self.registry, channel) {
            self.connection.submit_poll(variable)?;
        }
        Ok(())
    }

    /// Poll every addressable variable that is missing from the cache or has
    /// outlived its TTL. Returns how many polls went out.
    pub fn poll_stale(&self) -> Result<usize, Error> {
        let mut variables = BTreeSet::new();
        for channel in Channel::iter() {
            if let Some(variable) = self.registry.variable_of(channel) {
                variables.insert(variable);
            }
        }
        let mut polled = 0;
        for variable in variables {
            if self.cache.is_expired(variable) {
                self.connection.submit_poll(variable)?;
                polled += 1;
            }
        }
        Ok(polled)
    }

    /// Submit the command(s) setting `channel`; returns how many commands
    /// went out (the CO2 set point needs two).
    pub fn set(&self, channel: Channel, input: &str) -> Result<usize, Error> {
        let plan = write_plan(&self.registry, &self.cache, channel, input)?;
        let commands = plan.len();
        for (variable, value) in plan {
            self.connection.submit_command(variable, value)?;
        }
        Ok(commands)
    }
}
