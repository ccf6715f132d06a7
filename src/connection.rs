use crate::send_queue::{DISPATCH_INTERVAL, Dispatch, SendQueue};
use crate::telegram::{self, FrameState, LinkState, Telegram, TelegramCodec};
use futures::{SinkExt as _, StreamExt as _};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tokio_serial::SerialStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const SERIAL_BAUDRATE: u32 = 9600;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const EVENT_CAPACITY: usize = 1024;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("panel number {0} is outside the 1-8 range the bus supports")]
    BadPanelNumber(u8),
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("connecting to `{0}` timed out")]
    ConnectTimeout(String),
    #[error("could not open serial device {1:?}")]
    OpenDevice(#[source] tokio_serial::Error, PathBuf),
    #[error("scheduling a telegram failed, the connection worker is gone")]
    ScheduleRequest(#[source] SendError<Telegram>),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("could not send out the telegram")]
    Send(#[source] std::io::Error),
    #[error("writing a telegram timed out")]
    SendTimeout,
}

/// What the connection reports to its subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    Connected,
    /// Every decoded inbound frame, plus the synthesized ACK telegram once a
    /// command's acknowledgement byte matches.
    Telegram(Telegram),
    /// A command ran out of retries without a matching ACK byte. The
    /// connection itself stays usable.
    AckTimeout(Telegram),
    /// Emitted exactly once when the worker stops, cleanly or not.
    Disconnected { reason: String },
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    #[clap(flatten)]
    how: ConnectionGroup,

    /// Control panel number (1-8) used as our address on the bus.
    #[arg(long, short = 'p', default_value_t = 1)]
    panel: u8,

    /// Baudrate of the serial connection. The SE units speak 9600 8N1.
    #[arg(long, default_value_t = SERIAL_BAUDRATE)]
    baudrate: u32,

    /// Consider the connection dead when a telegram write takes this long.
    #[arg(long, default_value = "500ms")]
    write_timeout: humantime::Duration,

    /// Give up establishing the connection after this long.
    #[arg(long, default_value = "5s")]
    connect_timeout: humantime::Duration,
}

#[derive(clap::Parser, Clone)]
#[group(required = true)]
pub struct ConnectionGroup {
    /// Connect to the unit through a TCP serial bridge (host:port).
    #[arg(long)]
    tcp: Option<String>,

    /// Connect to the unit through the RS-485 serial port at this path.
    #[arg(long)]
    serial: Option<PathBuf>,
}

/// The physical link. One variant per supported transport, one capability
/// set; the codec and worker never care which one they run on.
pub enum Transport {
    Tcp(TcpStream),
    Serial(SerialStream),
}

impl Transport {
    async fn connect(args: &Args) -> Result<Self, Error> {
        if let Some(address) = &args.how.tcp {
            info!(message = "connecting...", address);
            let addresses = tokio::net::lookup_host(address)
                .await
                .map_err(|e| Error::LookupHost(e, address.to_string()))?
                .collect::<Vec<_>>();
            debug!(message = "resolved", ?addresses);
            let socket =
                tokio::time::timeout(*args.connect_timeout, TcpStream::connect(&*addresses))
                    .await
                    .map_err(|_| Error::ConnectTimeout(address.to_string()))?
                    .map_err(|e| Error::Connect(e, address.to_string()))?;
            let nodelay_result = socket.set_nodelay(true);
            trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
            info!(message = "connected");
            Ok(Transport::Tcp(socket))
        } else if let Some(path) = &args.how.serial {
            info!(message = "opening serial device", path = %path.display());
            let builder = tokio_serial::new(path.to_string_lossy(), args.baudrate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One);
            let stream =
                SerialStream::open(&builder).map_err(|e| Error::OpenDevice(e, path.clone()))?;
            info!(message = "serial device open");
            Ok(Transport::Serial(stream))
        } else {
            panic!("both `--tcp` and `--serial` are `None`?");
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Serial(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Serial(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Serial(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Serial(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// One open link to the unit.
///
/// Owns the worker task that reads and decodes frames and paces the send
/// queue. Decoded telegrams and status transitions fan out over a broadcast
/// channel; polls and commands go in through [`Connection::submit_poll`] and
/// [`Connection::submit_command`].
pub struct Connection {
    requests: UnboundedSender<Telegram>,
    events: broadcast::Sender<Event>,
    link: Arc<LinkState>,
    cancel: CancellationToken,
    worker: Mutex<Option<tokio::task::JoinHandle<Result<(), Error>>>>,
    panel: u8,
}

impl Connection {
    pub async fn new(args: Args) -> Result<Connection, Error> {
        let panel = telegram::panel_address(args.panel)
            .ok_or_else(|| Error::BadPanelNumber(args.panel))?;
        let transport = Transport::connect(&args).await?;
        let link = Arc::new(LinkState::default());
        let framed = Framed::new(transport, TelegramCodec::new(panel, Arc::clone(&link)));
        let (requests, jobs) = tokio::sync::mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let worker = Worker {
            queue: SendQueue::default(),
            link: Arc::clone(&link),
            events: events.clone(),
            cancel: cancel.clone(),
            write_timeout: *args.write_timeout,
        }
        .spawn(framed, jobs);
        Ok(Self { requests, events, link, cancel, worker: Mutex::new(Some(worker)), panel })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn link(&self) -> &LinkState {
        &self.link
    }

    pub fn is_connected(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    pub fn submit_poll(&self, variable: u8) -> Result<(), Error> {
        self.submit(Telegram::poll(self.panel, variable))
    }

    pub fn submit_command(&self, variable: u8, value: u8) -> Result<(), Error> {
        self.submit(Telegram::command(self.panel, variable, value))
    }

    fn submit(&self, telegram: Telegram) -> Result<(), Error> {
        self.requests.send(telegram).map_err(Error::ScheduleRequest)
    }

    /// Stop the worker and release the transport. Safe to call repeatedly;
    /// waits a bounded time for the read loop to wind down.
    pub async fn close(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            match tokio::time::timeout(CLOSE_TIMEOUT, worker).await {
                Err(_) => warn!("connection worker did not stop in time"),
                Ok(Err(e)) => warn!(message = "connection worker panicked", error = %e),
                Ok(Ok(_)) => debug!("connection closed"),
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    queue: SendQueue,
    link: Arc<LinkState>,
    events: broadcast::Sender<Event>,
    cancel: CancellationToken,
    write_timeout: Duration,
}

impl Worker {
    fn spawn(
        self,
        framed: Framed<Transport, TelegramCodec>,
        jobs: UnboundedReceiver<Telegram>,
    ) -> tokio::task::JoinHandle<Result<(), Error>> {
        tokio::task::spawn(self.main_loop(framed, jobs))
    }

    async fn main_loop(
        mut self,
        framed: Framed<Transport, TelegramCodec>,
        mut jobs: UnboundedReceiver<Telegram>,
    ) -> Result<(), Error> {
        let _ = self.events.send(Event::Connected);
        let (mut sink, mut stream) = framed.split();
        let mut tick = tokio::time::interval(DISPATCH_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let result = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    break Ok(());
                }
                frame = stream.next() => {
                    match frame {
                        None => break Err(Error::Receive(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed by peer",
                        ))),
                        Some(Err(e)) => break Err(Error::Receive(e)),
                        Some(Ok(telegram)) => {
                            trace!(
                                message = "received",
                                details = telegram.state.details(),
                                telegram = %telegram,
                            );
                            let _ = self.events.send(Event::Telegram(telegram));
                        }
                    }
                }
                job = jobs.recv() => {
                    match job {
                        None => break Ok(()),
                        Some(telegram) => self.queue.submit(telegram),
                    }
                }
                _ = tick.tick() => {
                    match self.queue.tick(&self.link) {
                        None => {}
                        Some(Dispatch::Write(telegram)) => {
                            let write = tokio::time::timeout(
                                self.write_timeout,
                                sink.send(telegram),
                            );
                            match write.await {
                                Err(_) => break Err(Error::SendTimeout),
                                Ok(Err(e)) => break Err(Error::Send(e)),
                                Ok(Ok(())) => debug!(message = "wrote", telegram = %telegram),
                            }
                        }
                        Some(Dispatch::Acked(telegram)) => {
                            let _ = self.events.send(Event::Telegram(Telegram::single(
                                FrameState::Ack,
                                telegram.checksum(),
                            )));
                        }
                        Some(Dispatch::AckTimeout(telegram)) => {
                            let _ = self.events.send(Event::AckTimeout(telegram));
                        }
                    }
                }
            }
        };
        let reason = match &result {
            Ok(()) => "closed".to_string(),
            Err(e) => e.to_string(),
        };
        if result.is_err() {
            warn!(message = "connection lost", reason);
        } else {
            info!("connection closed");
        }
        let _ = self.events.send(Event::Disconnected { reason });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::{
        ADDRESS_ALL_PANELS, ADDRESS_MASTER, ADDRESS_PANEL_1, DOMAIN, POLL_BYTE, RESUME_BYTE,
        SUSPEND_BYTE, checksum,
    };
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    fn args_for(addr: std::net::SocketAddr) -> Args {
        Args {
            how: ConnectionGroup { tcp: Some(addr.to_string()), serial: None },
            panel: 1,
            baudrate: SERIAL_BAUDRATE,
            write_timeout: "500ms".parse().unwrap(),
            connect_timeout: "5s".parse().unwrap(),
        }
    }

    async fn recv_matching(
        events: &mut broadcast::Receiver<Event>,
        mut matches: impl FnMut(&Event) -> bool,
    ) -> Event {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("timed out waiting for an event")
                .expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn polls_reach_the_device_and_replies_come_back_decoded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut poll = [0u8; 6];
            socket.read_exact(&mut poll).await.unwrap();
            let mut reply = [DOMAIN, ADDRESS_MASTER, ADDRESS_PANEL_1, poll[4], 0x07, 0];
            reply[5] = checksum(&reply);
            socket.write_all(&reply).await.unwrap();
            // Hold the socket open until the client hangs up.
            let mut rest = [0u8; 1];
            let _ = socket.read(&mut rest).await;
            poll
        });

        let connection = Connection::new(args_for(addr)).await.unwrap();
        assert!(connection.is_connected());
        let mut events = connection.subscribe();
        connection.submit_poll(0x29).unwrap();

        let event = recv_matching(&mut events, |e| {
            matches!(e, Event::Telegram(t) if t.state == FrameState::Ok)
        })
        .await;
        let Event::Telegram(reply) = event else { unreachable!() };
        assert_eq!(reply.variable(), 0x29);
        assert_eq!(reply.value(), 0x07);

        connection.close().await;
        let poll = device.await.unwrap();
        assert_eq!(poll[0], DOMAIN);
        assert_eq!(poll[1], ADDRESS_PANEL_1);
        assert_eq!(poll[2], ADDRESS_MASTER);
        assert_eq!(poll[3], POLL_BYTE);
        assert_eq!(poll[4], 0x29);
        assert_eq!(checksum(&poll), poll[5]);
    }

    #[tokio::test]
    async fn an_acknowledged_command_emits_the_ack_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut command = [0u8; 6];
            socket.read_exact(&mut command).await.unwrap();
            socket.write_all(&[command[5]]).await.unwrap();
            let mut rest = [0u8; 1];
            let _ = socket.read(&mut rest).await;
            command
        });

        let connection = Connection::new(args_for(addr)).await.unwrap();
        let mut events = connection.subscribe();
        connection.submit_command(0x29, 0x07).unwrap();

        let event = recv_matching(&mut events, |e| {
            matches!(e, Event::Telegram(t) if t.state == FrameState::Ack)
        })
        .await;
        let Event::Telegram(ack) = event else { unreachable!() };

        connection.close().await;
        let command = device.await.unwrap();
        assert_eq!(command[3], 0x29);
        assert_eq!(command[4], 0x07);
        assert_eq!(ack.bytes[0], command[5]);
    }

    #[tokio::test]
    async fn unacknowledged_commands_fail_without_killing_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Swallow everything, never acknowledge.
            let mut written = Vec::new();
            let _ = socket.read_to_end(&mut written).await;
            written
        });

        let connection = Connection::new(args_for(addr)).await.unwrap();
        let mut events = connection.subscribe();
        connection.submit_command(0x29, 0x07).unwrap();

        let event = recv_matching(&mut events, |e| matches!(e, Event::AckTimeout(_))).await;
        let Event::AckTimeout(failed) = event else { unreachable!() };
        assert_eq!(failed.variable(), 0x29);
        assert!(connection.is_connected());

        connection.close().await;
        let written = device.await.unwrap();
        // One transmission per retry, nothing else on the wire.
        assert_eq!(written.len(), 6 * usize::from(crate::send_queue::COMMAND_RETRIES));
    }

    #[tokio::test]
    async fn suspend_gates_the_queue_until_resume() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Give the client a moment to subscribe before the first frame.
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut suspend = [DOMAIN, ADDRESS_MASTER, ADDRESS_ALL_PANELS, SUSPEND_BYTE, 0, 0];
            suspend[5] = checksum(&suspend);
            socket.write_all(&suspend).await.unwrap();

            let mut poll = [0u8; 6];
            let silent =
                tokio::time::timeout(Duration::from_millis(1500), socket.read_exact(&mut poll))
                    .await;
            assert!(silent.is_err(), "received bytes while traffic was suspended");

            let mut resume = [DOMAIN, ADDRESS_MASTER, ADDRESS_ALL_PANELS, RESUME_BYTE, 0, 0];
            resume[5] = checksum(&resume);
            socket.write_all(&resume).await.unwrap();
            socket.read_exact(&mut poll).await.unwrap();
            poll
        });

        let connection = Connection::new(args_for(addr)).await.unwrap();
        let mut events = connection.subscribe();
        recv_matching(&mut events, |e| {
            matches!(e, Event::Telegram(t) if t.state == FrameState::Suspend)
        })
        .await;
        connection.submit_poll(0x29).unwrap();
        recv_matching(&mut events, |e| {
            matches!(e, Event::Telegram(t) if t.state == FrameState::Resume)
        })
        .await;

        let poll = device.await.unwrap();
        assert_eq!(poll[4], 0x29);
        connection.close().await;
    }

    #[tokio::test]
    async fn refused_connections_surface_as_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        match Connection::new(args_for(addr)).await {
            Err(Error::Connect(..)) => {}
            Err(other) => panic!("expected a connect error, got {other:?}"),
            Ok(_) => panic!("expected a connect error, got a connection"),
        }
    }

    #[tokio::test]
    async fn peer_hangup_is_reported_once_and_close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let connection = Connection::new(args_for(addr)).await.unwrap();
        let mut events = connection.subscribe();
        device.await.unwrap();

        recv_matching(&mut events, |e| matches!(e, Event::Disconnected { .. })).await;
        assert!(!connection.is_connected());

        connection.close().await;
        connection.close().await;
        assert!(!connection.is_connected());
    }
}
