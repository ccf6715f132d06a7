pub mod channels {
    use crate::channels::{Channel, Descriptor, Registry};
    use strum::IntoEnumIterator as _;

    /// List and search the known channels.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: crate::output::Args,
        /// Only show channels whose name or group contains this string.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Channels(#[from] crate::channels::ConfigurationError),
        #[error(transparent)]
        Output(#[from] crate::output::Error),
    }

    #[derive(serde::Serialize)]
    struct ChannelSchema {
        channel: Channel,
        group: &'static str,
        kind: &'static str,
        variable: Option<u8>,
        detail: String,
    }

    fn schema(registry: &Registry, channel: Channel) -> ChannelSchema {
        let (kind, detail) = match registry.describe(channel) {
            Descriptor::Boolean { parent, mask } => {
                ("boolean", format!("bit {mask:#04X} of {parent}"))
            }
            Descriptor::Masked { parent, mask } => {
                ("field", format!("bits {mask:#04X} of {parent}"))
            }
            Descriptor::Integer { .. } => ("integer", String::new()),
            Descriptor::Temperature { .. } => ("temperature", String::new()),
            Descriptor::FanSpeed { .. } => ("fan speed", String::new()),
            Descriptor::Humidity { .. } => ("humidity", String::new()),
            Descriptor::Multi { subs, .. } => {
                let subs =
                    subs.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", ");
                ("multi", subs)
            }
            Descriptor::Virtual => ("computed", String::new()),
        };
        ChannelSchema {
            channel,
            group: channel.group(),
            kind,
            variable: registry.variable_of(channel),
            detail,
        }
    }

    impl ChannelSchema {
        fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_uppercase();
            self.channel.to_string().to_uppercase().contains(&pattern)
                || self.group.to_uppercase().contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let registry = Registry::new()?;
        let mut output = args.output.to_output()?;
        output.headers(vec!["Channel", "Group", "Kind", "Variable", "Detail"])?;
        for channel in Channel::iter() {
            let schema = schema(&registry, channel);
            if let Some(pattern) = &args.filter {
                if !schema.is_match(pattern) {
                    continue;
                }
            }
            output.record(
                || {
                    vec![
                        schema.channel.to_string(),
                        schema.group.to_string(),
                        schema.kind.to_string(),
                        schema.variable.map(|v| format!("{v:#04X}")).unwrap_or_default(),
                        schema.detail.clone(),
                    ]
                },
                || &schema,
            )?;
        }
        output.commit()?;
        Ok(())
    }
}

pub mod read {
    use crate::channels::{Channel, Registry};
    use crate::connection::{Connection, Event};
    use crate::device::{Device, poll_plan};
    use crate::engine::Value;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Arc;
    use strum::IntoEnumIterator as _;
    use tokio::sync::broadcast::error::RecvError;
    use tracing::warn;

    /// Poll channels and print their values once they arrive.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: crate::connection::Args,
        #[clap(flatten)]
        output: crate::output::Args,
        /// Channels to read. Reads every known channel when omitted.
        channels: Vec<String>,
        /// Stop waiting for outstanding values after this long.
        #[arg(long, default_value = "60s")]
        timeout: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Channels(#[from] crate::channels::ConfigurationError),
        #[error(transparent)]
        Connection(#[from] crate::connection::Error),
        #[error(transparent)]
        Device(#[from] crate::device::Error),
        #[error(transparent)]
        Output(#[from] crate::output::Error),
        #[error("connection lost: {0}")]
        ConnectionLost(String),
    }

    #[derive(serde::Serialize)]
    struct ReadRecord {
        channel: Channel,
        group: &'static str,
        value: Value,
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let registry = Registry::new()?;
        let wanted: Vec<Channel> = if args.channels.is_empty() {
            Channel::iter().collect()
        } else {
            args.channels
                .iter()
                .map(|name| registry.parse(name))
                .collect::<Result<_, _>>()?
        };

        let connection = Arc::new(Connection::new(args.connection).await?);
        let device = Device::new(registry, Arc::clone(&connection));
        let mut events = connection.subscribe();
        // Bit views share parent bytes, poll each variable only once.
        let mut variables = BTreeSet::new();
        for &channel in &wanted {
            variables.extend(poll_plan(device.registry(), channel));
        }
        for variable in variables {
            connection.submit_poll(variable)?;
        }

        let mut resolved: HashMap<Channel, Value> = HashMap::new();
        let deadline = tokio::time::Instant::now() + *args.timeout;
        loop {
            let event = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                event = events.recv() => event,
            };
            match event {
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
                Ok(Event::Disconnected { reason }) => return Err(Error::ConnectionLost(reason)),
                Ok(event) => {
                    for (channel, value) in device.handle_event(&event) {
                        resolved.insert(channel, value);
                    }
                }
            }
            let done = wanted
                .iter()
                .all(|c| resolved.get(c).is_some_and(|v| *v != Value::Undefined));
            if done {
                break;
            }
        }
        connection.close().await;

        let mut output = args.output.to_output()?;
        output.headers(vec!["Channel", "Group", "Value"])?;
        for &channel in &wanted {
            let value = resolved.get(&channel).copied().unwrap_or(Value::Undefined);
            output.record(
                || vec![channel.to_string(), channel.group().to_string(), value.to_string()],
                || ReadRecord { channel, group: channel.group(), value },
            )?;
        }
        output.commit()?;
        Ok(())
    }
}

pub mod set {
    use crate::channels::{Channel, Descriptor, Registry};
    use crate::connection::{Connection, Event};
    use crate::device::Device;
    use crate::telegram::FrameState;
    use std::sync::Arc;
    use tokio::sync::broadcast::error::RecvError;
    use tracing::{info, warn};

    /// Write a value to a channel and wait for the unit's acknowledgement.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: crate::connection::Args,
        /// The channel to write.
        channel: String,
        /// The value: a number for most channels, on/off for switches.
        value: String,
        /// Give up waiting for the acknowledgement after this long.
        #[arg(long, default_value = "30s")]
        timeout: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Channels(#[from] crate::channels::ConfigurationError),
        #[error(transparent)]
        Connection(#[from] crate::connection::Error),
        #[error(transparent)]
        Device(#[from] crate::device::Error),
        #[error("connection lost: {0}")]
        ConnectionLost(String),
        #[error("no current value for {0} arrived in time")]
        NoCurrentValue(Channel),
        #[error("the unit did not acknowledge the command for {0}")]
        AckNotReceived(Channel),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let registry = Registry::new()?;
        let channel = registry.parse(&args.channel)?;
        let connection = Arc::new(Connection::new(args.connection).await?);
        let device = Device::new(registry, Arc::clone(&connection));
        let mut events = connection.subscribe();
        let deadline = tokio::time::Instant::now() + *args.timeout;

        // Bit fields merge into their parent byte, so its current value has
        // to be in the cache before the write can be encoded.
        if matches!(
            registry.describe(channel),
            Descriptor::Boolean { .. } | Descriptor::Masked { .. }
        ) {
            device.poll(channel)?;
            let variable = registry.variable_of(channel).unwrap_or_default();
            while device.cache().get(variable).is_none() {
                let event = tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        return Err(Error::NoCurrentValue(channel));
                    }
                    event = events.recv() => event,
                };
                match event {
                    Err(RecvError::Lagged(missed)) => warn!(missed, "event stream lagged"),
                    Err(RecvError::Closed) => return Err(Error::NoCurrentValue(channel)),
                    Ok(Event::Disconnected { reason }) => {
                        return Err(Error::ConnectionLost(reason));
                    }
                    Ok(event) => {
                        device.handle_event(&event);
                    }
                }
            }
        }

        let commands = device.set(channel, &args.value)?;
        let mut acked = 0;
        while acked < commands {
            let event = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::AckNotReceived(channel));
                }
                event = events.recv() => event,
            };
            match event {
                Err(RecvError::Lagged(missed)) => warn!(missed, "event stream lagged"),
                Err(RecvError::Closed) => return Err(Error::AckNotReceived(channel)),
                Ok(Event::Disconnected { reason }) => return Err(Error::ConnectionLost(reason)),
                Ok(Event::AckTimeout(_)) => return Err(Error::AckNotReceived(channel)),
                Ok(Event::Telegram(telegram)) if telegram.state == FrameState::Ack => {
                    acked += 1;
                }
                Ok(event) => {
                    device.handle_event(&event);
                }
            }
        }
        info!(message = "command acknowledged", channel = %channel);
        println!("{channel} set to {}", args.value);
        connection.close().await;
        Ok(())
    }
}

pub mod monitor {
    use crate::channels::{Channel, Registry};
    use crate::connection::{Connection, Event};
    use crate::device::Device;
    use crate::engine::Value;
    use std::sync::Arc;
    use tokio::sync::broadcast::error::RecvError;
    use tracing::{debug, warn};

    /// Connect and stream channel updates until interrupted.
    ///
    /// Every addressable variable is polled at startup; variables whose cache
    /// entry outlives its TTL are re-polled on the heartbeat.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: crate::connection::Args,
        #[clap(flatten)]
        output: crate::output::Args,
        /// Cadence of the stale-channel re-polling heartbeat.
        #[arg(long, default_value = "1m")]
        heartbeat: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Channels(#[from] crate::channels::ConfigurationError),
        #[error(transparent)]
        Connection(#[from] crate::connection::Error),
        #[error(transparent)]
        Device(#[from] crate::device::Error),
        #[error(transparent)]
        Output(#[from] crate::output::Error),
        #[error("connection lost: {0}")]
        ConnectionLost(String),
    }

    #[derive(serde::Serialize)]
    struct UpdateRecord {
        time: String,
        channel: Channel,
        value: Value,
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let registry = Registry::new()?;
        let connection = Arc::new(Connection::new(args.connection).await?);
        let device = Device::new(registry, Arc::clone(&connection));
        let mut events = connection.subscribe();
        let mut output = args.output.to_output()?;
        output.headers(vec!["Time", "Channel", "Value"])?;

        let mut heartbeat = tokio::time::interval(*args.heartbeat);
        let result = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break Ok(()),
                _ = heartbeat.tick() => {
                    let polled = device.poll_stale()?;
                    debug!(message = "heartbeat", polled);
                }
                event = events.recv() => {
                    match event {
                        Err(RecvError::Lagged(missed)) => warn!(missed, "event stream lagged"),
                        Err(RecvError::Closed) => break Ok(()),
                        Ok(Event::Disconnected { reason }) => {
                            break Err(Error::ConnectionLost(reason));
                        }
                        Ok(event) => {
                            for (channel, value) in device.handle_event(&event) {
                                let time = jiff::Zoned::now().strftime("%H:%M:%S").to_string();
                                output.record(
                                    || vec![time.clone(), channel.to_string(), value.to_string()],
                                    || UpdateRecord { time: time.clone(), channel, value },
                                )?;
                            }
                        }
                    }
                }
            }
        };
        output.commit()?;
        connection.close().await;
        result
    }
}
