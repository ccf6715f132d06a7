use strum::IntoEnumIterator as _;

/// Logical channel ids of the Vallox SE protocol.
///
/// Names follow the vendor documentation. Multi-value ids (`Select`,
/// `Program1`, the flag bytes, the IO port bytes) address the raw byte on the
/// bus; the boolean ids are bit views over them and are not independently
/// addressable.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
pub enum Channel {
    // Fan control
    FanSpeed,
    FanSpeedMax,
    FanSpeedMin,
    DcFanInputAdjustment,
    DcFanOutputAdjustment,
    SupplyFanState,
    ExhaustFanState,
    // Temperatures
    TempInside,
    TempOutside,
    TempExhaust,
    TempIncoming,
    // Heat recovery efficiencies, computed from the four temperatures
    InEfficiency,
    OutEfficiency,
    AverageEfficiency,
    // Settings
    PowerState,
    Co2AdjustState,
    HumidityAdjustState,
    PostHeatingState,
    HrcBypassThreshold,
    InputFanStopThreshold,
    PostHeatingSetPoint,
    PreHeatingSetPoint,
    Co2SetPoint,
    Co2SetPointHigh,
    Co2SetPointLow,
    CascadeAdjust,
    AdjustmentIntervalMinutes,
    MaxSpeedLimitMode,
    BasicHumidityLevel,
    BoostSwitchMode,
    RadiatorType,
    ActivateFirePlaceBooster,
    AutomaticHumidityLevelSeekerState,
    PreHeatingState,
    // Status
    Humidity,
    HumiditySensor1,
    HumiditySensor2,
    Co2,
    Co2High,
    Co2Low,
    PostHeatingIndicator,
    InstalledCo2Sensors,
    PreHeatingOn,
    PostHeatingOn,
    DamperMotorPosition,
    FirePlaceBoosterSwitch,
    IncomingCurrent,
    SlaveMasterIndicator,
    PostHeatingTargetValue,
    FirePlaceBoosterOn,
    FirePlaceBoosterCounter,
    RemoteControlOn,
    // Maintenance
    FilterGuardIndicator,
    ServiceReminderIndicator,
    MaintenanceMonthCounter,
    ServiceReminder,
    // Alarms
    FaultIndicator,
    FaultSignalRelayClosed,
    Co2Alarm,
    HrcFreezingAlarm,
    WaterRadiatorFreezingAlarm,
    LastErrorNumber,
    // Raw multi-value bytes
    IoPortMultiPurpose1,
    IoPortMultiPurpose2,
    Flags2,
    Flags4,
    Flags5,
    Flags6,
    Select,
    Program1,
    Program2,
}

/// How a channel's value relates to telegram bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    /// Single bit inside a multi-value parent byte.
    Boolean { parent: Channel, mask: u8 },
    /// Numeric bit field inside a multi-value parent byte.
    Masked { parent: Channel, mask: u8 },
    /// Raw unsigned byte.
    Integer { variable: u8 },
    /// Byte indexed through the NTC temperature table.
    Temperature { variable: u8 },
    /// Byte indexed through the fan speed table.
    FanSpeed { variable: u8 },
    /// Byte through the humidity formula.
    Humidity { variable: u8 },
    /// Raw byte fanning out to bit-view sub-channels.
    Multi { variable: u8, subs: &'static [Channel] },
    /// Computed by the derived value engine, no variable of its own.
    Virtual,
}

impl Channel {
    pub fn descriptor(self) -> Descriptor {
        use Channel::*;
        use Descriptor as D;
        match self {
            FanSpeed => D::FanSpeed { variable: 0x29 },
            FanSpeedMax => D::FanSpeed { variable: 0xA5 },
            FanSpeedMin => D::FanSpeed { variable: 0xA9 },
            DcFanInputAdjustment => D::Integer { variable: 0xB0 },
            DcFanOutputAdjustment => D::Integer { variable: 0xB1 },
            SupplyFanState => D::Boolean { parent: IoPortMultiPurpose2, mask: 0x08 },
            ExhaustFanState => D::Boolean { parent: IoPortMultiPurpose2, mask: 0x20 },

            TempInside => D::Temperature { variable: 0x34 },
            TempOutside => D::Temperature { variable: 0x32 },
            TempExhaust => D::Temperature { variable: 0x33 },
            TempIncoming => D::Temperature { variable: 0x35 },

            InEfficiency | OutEfficiency | AverageEfficiency => D::Virtual,

            PowerState => D::Boolean { parent: Select, mask: 0x01 },
            Co2AdjustState => D::Boolean { parent: Select, mask: 0x02 },
            HumidityAdjustState => D::Boolean { parent: Select, mask: 0x04 },
            PostHeatingState => D::Boolean { parent: Select, mask: 0x08 },
            HrcBypassThreshold => D::Temperature { variable: 0xAF },
            InputFanStopThreshold => D::Temperature { variable: 0xA8 },
            PostHeatingSetPoint => D::Temperature { variable: 0xA4 },
            PreHeatingSetPoint => D::Temperature { variable: 0xA7 },
            Co2SetPoint => D::Virtual,
            Co2SetPointHigh => D::Integer { variable: 0xB3 },
            Co2SetPointLow => D::Integer { variable: 0xB4 },
            CascadeAdjust => D::Boolean { parent: Program1, mask: 0x80 },
            AdjustmentIntervalMinutes => D::Masked { parent: Program1, mask: 0x0F },
            MaxSpeedLimitMode => D::Boolean { parent: Program2, mask: 0x01 },
            BasicHumidityLevel => D::Humidity { variable: 0xAE },
            BoostSwitchMode => D::Boolean { parent: Program1, mask: 0x20 },
            RadiatorType => D::Boolean { parent: Program1, mask: 0x40 },
            ActivateFirePlaceBooster => D::Boolean { parent: Flags6, mask: 0x20 },
            AutomaticHumidityLevelSeekerState => D::Boolean { parent: Program1, mask: 0x10 },
            PreHeatingState => D::Boolean { parent: Flags5, mask: 0x80 },

            Humidity => D::Humidity { variable: 0x2A },
            HumiditySensor1 => D::Humidity { variable: 0x2F },
            HumiditySensor2 => D::Humidity { variable: 0x30 },
            Co2 => D::Virtual,
            Co2High => D::Integer { variable: 0x2B },
            Co2Low => D::Integer { variable: 0x2C },
            PostHeatingIndicator => D::Boolean { parent: Select, mask: 0x20 },
            InstalledCo2Sensors => D::Integer { variable: 0x2D },
            PreHeatingOn => D::Boolean { parent: IoPortMultiPurpose2, mask: 0x10 },
            PostHeatingOn => D::Boolean { parent: IoPortMultiPurpose1, mask: 0x20 },
            DamperMotorPosition => D::Boolean { parent: IoPortMultiPurpose2, mask: 0x02 },
            FirePlaceBoosterSwitch => D::Boolean { parent: IoPortMultiPurpose2, mask: 0x40 },
            IncomingCurrent => D::Integer { variable: 0x2E },
            SlaveMasterIndicator => D::Boolean { parent: Flags4, mask: 0x80 },
            PostHeatingTargetValue => D::Temperature { variable: 0x57 },
            FirePlaceBoosterOn => D::Boolean { parent: Flags6, mask: 0x40 },
            FirePlaceBoosterCounter => D::Integer { variable: 0x79 },
            RemoteControlOn => D::Boolean { parent: Flags6, mask: 0x10 },

            FilterGuardIndicator => D::Boolean { parent: Select, mask: 0x10 },
            ServiceReminderIndicator => D::Boolean { parent: Select, mask: 0x80 },
            MaintenanceMonthCounter => D::Integer { variable: 0xAB },
            ServiceReminder => D::Integer { variable: 0xA6 },

            FaultIndicator => D::Boolean { parent: Select, mask: 0x40 },
            FaultSignalRelayClosed => D::Boolean { parent: IoPortMultiPurpose2, mask: 0x04 },
            Co2Alarm => D::Boolean { parent: Flags2, mask: 0x40 },
            HrcFreezingAlarm => D::Boolean { parent: Flags2, mask: 0x80 },
            WaterRadiatorFreezingAlarm => D::Boolean { parent: Flags4, mask: 0x10 },
            LastErrorNumber => D::Integer { variable: 0x36 },

            IoPortMultiPurpose1 => D::Multi { variable: 0x07, subs: &[PostHeatingOn] },
            IoPortMultiPurpose2 => D::Multi {
                variable: 0x08,
                subs: &[
                    DamperMotorPosition,
                    FaultSignalRelayClosed,
                    SupplyFanState,
                    PreHeatingOn,
                    ExhaustFanState,
                    FirePlaceBoosterSwitch,
                ],
            },
            Flags2 => D::Multi { variable: 0x6D, subs: &[Co2Alarm, HrcFreezingAlarm] },
            Flags4 => D::Multi {
                variable: 0x6F,
                subs: &[WaterRadiatorFreezingAlarm, SlaveMasterIndicator],
            },
            Flags5 => D::Multi { variable: 0x70, subs: &[PreHeatingState] },
            Flags6 => D::Multi {
                variable: 0x71,
                subs: &[RemoteControlOn, ActivateFirePlaceBooster, FirePlaceBoosterOn],
            },
            Select => D::Multi {
                variable: 0xA3,
                subs: &[
                    PowerState,
                    Co2AdjustState,
                    HumidityAdjustState,
                    PostHeatingState,
                    FilterGuardIndicator,
                    PostHeatingIndicator,
                    FaultIndicator,
                    ServiceReminderIndicator,
                ],
            },
            Program1 => D::Multi {
                variable: 0xAA,
                subs: &[
                    AdjustmentIntervalMinutes,
                    AutomaticHumidityLevelSeekerState,
                    BoostSwitchMode,
                    RadiatorType,
                    CascadeAdjust,
                ],
            },
            Program2 => D::Multi { variable: 0xB5, subs: &[MaxSpeedLimitMode] },
        }
    }

    pub fn group(self) -> &'static str {
        use Channel::*;
        match self {
            FanSpeed | FanSpeedMax | FanSpeedMin | DcFanInputAdjustment | DcFanOutputAdjustment
            | SupplyFanState | ExhaustFanState => "FanControl",
            TempInside | TempOutside | TempExhaust | TempIncoming => "Temperature",
            InEfficiency | OutEfficiency | AverageEfficiency => "Efficiency",
            PowerState | Co2AdjustState | HumidityAdjustState | PostHeatingState
            | HrcBypassThreshold | InputFanStopThreshold | PostHeatingSetPoint
            | PreHeatingSetPoint | Co2SetPoint | Co2SetPointHigh | Co2SetPointLow
            | CascadeAdjust | AdjustmentIntervalMinutes | MaxSpeedLimitMode
            | BasicHumidityLevel | BoostSwitchMode | RadiatorType | ActivateFirePlaceBooster
            | AutomaticHumidityLevelSeekerState | PreHeatingState => "Setting",
            Humidity | HumiditySensor1 | HumiditySensor2 | Co2 | Co2High | Co2Low
            | PostHeatingIndicator | InstalledCo2Sensors | PreHeatingOn | PostHeatingOn
            | DamperMotorPosition | FirePlaceBoosterSwitch | IncomingCurrent
            | SlaveMasterIndicator | PostHeatingTargetValue | FirePlaceBoosterOn
            | FirePlaceBoosterCounter | RemoteControlOn => "Status",
            FilterGuardIndicator | ServiceReminderIndicator | MaintenanceMonthCounter
            | ServiceReminder => "Maintenance",
            FaultIndicator | FaultSignalRelayClosed | Co2Alarm | HrcFreezingAlarm
            | WaterRadiatorFreezingAlarm | LastErrorNumber => "Alarm",
            IoPortMultiPurpose1 | IoPortMultiPurpose2 | Flags2 | Flags4 | Flags5 | Flags6
            | Select | Program1 | Program2 => "MultiValue",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigurationError {
    #[error("`{0}` is not a known channel id")]
    UnknownChannel(String),
    #[error("sub-channel {sub} of {multi} is not a bit view of it")]
    BadSubChannel { multi: Channel, sub: Channel },
    #[error("multi-value channel {multi} lists another multi-value channel {sub}")]
    NestedMulti { multi: Channel, sub: Channel },
}

/// The channel table, validated once at startup and then shared by reference.
#[derive(Debug, Clone, Copy)]
pub struct Registry(());

impl Registry {
    pub fn new() -> Result<Self, ConfigurationError> {
        for channel in Channel::iter() {
            let Descriptor::Multi { subs, .. } = channel.descriptor() else {
                continue;
            };
            for &sub in subs {
                match sub.descriptor() {
                    Descriptor::Multi { .. } => {
                        return Err(ConfigurationError::NestedMulti { multi: channel, sub });
                    }
                    Descriptor::Boolean { parent, .. } | Descriptor::Masked { parent, .. }
                        if parent == channel => {}
                    _ => return Err(ConfigurationError::BadSubChannel { multi: channel, sub }),
                }
            }
        }
        Ok(Self(()))
    }

    pub fn describe(&self, channel: Channel) -> Descriptor {
        channel.descriptor()
    }

    /// Protocol variable carrying this channel. Bit views resolve through
    /// their parent byte; engine-computed channels have none.
    pub fn variable_of(&self, channel: Channel) -> Option<u8> {
        match channel.descriptor() {
            Descriptor::Boolean { parent, .. } | Descriptor::Masked { parent, .. } => {
                self.variable_of(parent)
            }
            Descriptor::Integer { variable }
            | Descriptor::Temperature { variable }
            | Descriptor::FanSpeed { variable }
            | Descriptor::Humidity { variable }
            | Descriptor::Multi { variable, .. } => Some(variable),
            Descriptor::Virtual => None,
        }
    }

    /// The channel a received variable byte addresses. Bit views are excluded,
    /// their multi-value parent is the addressable channel.
    pub fn channel_for_variable(&self, variable: u8) -> Option<Channel> {
        Channel::iter().find(|channel| match channel.descriptor() {
            Descriptor::Boolean { .. } | Descriptor::Masked { .. } | Descriptor::Virtual => false,
            Descriptor::Integer { variable: v }
            | Descriptor::Temperature { variable: v }
            | Descriptor::FanSpeed { variable: v }
            | Descriptor::Humidity { variable: v }
            | Descriptor::Multi { variable: v, .. } => v == variable,
        })
    }

    pub fn parse(&self, name: &str) -> Result<Channel, ConfigurationError> {
        name.parse::<Channel>()
            .map_err(|_| ConfigurationError::UnknownChannel(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator as _;

    #[test]
    fn registry_validates() {
        Registry::new().unwrap();
    }

    #[test]
    fn every_channel_resolves_to_a_variable_or_is_virtual() {
        let registry = Registry::new().unwrap();
        for channel in Channel::iter() {
            match channel.descriptor() {
                Descriptor::Virtual => assert_eq!(registry.variable_of(channel), None),
                _ => assert!(registry.variable_of(channel).is_some(), "{channel}"),
            }
        }
    }

    #[test]
    fn bit_views_resolve_through_their_parent() {
        let registry = Registry::new().unwrap();
        assert_eq!(registry.variable_of(Channel::PowerState), Some(0xA3));
        assert_eq!(registry.variable_of(Channel::SupplyFanState), Some(0x08));
        assert_eq!(registry.variable_of(Channel::AdjustmentIntervalMinutes), Some(0xAA));
    }

    #[test]
    fn variable_lookup_skips_bit_views() {
        let registry = Registry::new().unwrap();
        // 0xA3 carries eight booleans but addresses the Select byte.
        assert_eq!(registry.channel_for_variable(0xA3), Some(Channel::Select));
        assert_eq!(registry.channel_for_variable(0x34), Some(Channel::TempInside));
        assert_eq!(registry.channel_for_variable(0x29), Some(Channel::FanSpeed));
        assert_eq!(registry.channel_for_variable(0x2B), Some(Channel::Co2High));
        assert_eq!(registry.channel_for_variable(0xF2), None);
    }

    #[test]
    fn no_two_addressable_channels_share_a_variable() {
        use std::collections::HashMap;
        let mut seen: HashMap<u8, Channel> = HashMap::new();
        for channel in Channel::iter() {
            let variable = match channel.descriptor() {
                Descriptor::Boolean { .. } | Descriptor::Masked { .. } | Descriptor::Virtual => {
                    continue;
                }
                Descriptor::Integer { variable }
                | Descriptor::Temperature { variable }
                | Descriptor::FanSpeed { variable }
                | Descriptor::Humidity { variable }
                | Descriptor::Multi { variable, .. } => variable,
            };
            if let Some(previous) = seen.insert(variable, channel) {
                panic!("variable {variable:#04X} owned by both {previous} and {channel}");
            }
        }
    }

    #[test]
    fn channel_names_parse_back() {
        let registry = Registry::new().unwrap();
        assert_eq!(registry.parse("FanSpeed").unwrap(), Channel::FanSpeed);
        assert_eq!(registry.parse("fanspeed").unwrap(), Channel::FanSpeed);
        assert!(registry.parse("NoSuchChannel").is_err());
    }
}
