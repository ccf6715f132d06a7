use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio_util::bytes::Buf;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

pub const TELEGRAM_LENGTH: usize = 6;

/// Every valid frame on the RS-485 bus starts with this byte.
pub const DOMAIN: u8 = 0x01;
/// Variable byte of an outgoing frame that requests a value instead of setting one.
pub const POLL_BYTE: u8 = 0x00;
pub const ADDRESS_MASTER: u8 = 0x11;
pub const ADDRESS_ALL_PANELS: u8 = 0x20;
pub const ADDRESS_PANEL_1: u8 = 0x21;
/// The unit polls its CO2 sensors itself and claims the bus while doing so.
pub const SUSPEND_BYTE: u8 = 0x91;
pub const RESUME_BYTE: u8 = 0x8F;

/// Bus addresses of control panels 1 through 8.
pub const PANEL_ADDRESSES: [u8; 8] = [0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28];

/// Bus address for a 1-based panel number as configured on the unit.
pub fn panel_address(panel_number: u8) -> Option<u8> {
    PANEL_ADDRESSES.get(usize::from(panel_number.checked_sub(1)?)).copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Valid frame addressed to us (or broadcast).
    Ok,
    /// Single acknowledgement byte consumed while a command was pending.
    Ack,
    CrcError,
    NotForUs,
    NotDomain,
    Suspend,
    Resume,
    Empty,
    Corrupted,
    // Outgoing-only states.
    Poll,
    Command,
}

impl FrameState {
    pub fn details(&self) -> &'static str {
        match self {
            FrameState::Ok => "telegram received OK",
            FrameState::Ack => "ACK byte received",
            FrameState::CrcError => "checksum failed",
            FrameState::NotForUs => "telegram not for us",
            FrameState::NotDomain => "first byte is not the domain byte",
            FrameState::Suspend => "stop all traffic",
            FrameState::Resume => "resume normal use",
            FrameState::Empty => "empty telegram",
            FrameState::Corrupted => "telegram is corrupted",
            FrameState::Poll => "poll",
            FrameState::Command => "command",
        }
    }
}

/// One fixed six byte frame: domain, sender, receiver, variable, value, checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Telegram {
    pub state: FrameState,
    pub bytes: [u8; TELEGRAM_LENGTH],
}

impl Telegram {
    pub fn new(state: FrameState, bytes: [u8; TELEGRAM_LENGTH]) -> Self {
        Self { state, bytes }
    }

    /// Single-byte pseudo telegram, used for ACK bytes.
    pub fn single(state: FrameState, byte: u8) -> Self {
        let mut bytes = [0; TELEGRAM_LENGTH];
        bytes[0] = byte;
        Self { state, bytes }
    }

    /// Request the current value of `variable` from the unit.
    pub fn poll(panel: u8, variable: u8) -> Self {
        let mut bytes = [DOMAIN, panel, ADDRESS_MASTER, POLL_BYTE, variable, 0];
        bytes[5] = checksum(&bytes);
        Self { state: FrameState::Poll, bytes }
    }

    /// Set `variable` to `value` on the unit. The unit answers with a single
    /// ACK byte equal to the frame checksum.
    pub fn command(panel: u8, variable: u8, value: u8) -> Self {
        let mut bytes = [DOMAIN, panel, ADDRESS_MASTER, variable, value, 0];
        bytes[5] = checksum(&bytes);
        Self { state: FrameState::Command, bytes }
    }

    pub fn sender(&self) -> u8 {
        self.bytes[1]
    }

    pub fn receiver(&self) -> u8 {
        self.bytes[2]
    }

    pub fn variable(&self) -> u8 {
        self.bytes[3]
    }

    pub fn value(&self) -> u8 {
        self.bytes[4]
    }

    pub fn checksum(&self) -> u8 {
        self.bytes[5]
    }
}

impl std::fmt::Display for Telegram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, b) in self.bytes.iter().enumerate() {
            if i != 0 {
                f.write_str("-")?;
            }
            f.write_fmt(format_args!("{b:02X}"))?;
        }
        Ok(())
    }
}

/// Sum of the first five bytes, modulo 256.
pub fn checksum(bytes: &[u8; TELEGRAM_LENGTH]) -> u8 {
    bytes[..5].iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Flow control state shared between the read loop and the send queue tick.
///
/// The read loop stores into these; the next dispatch tick must observe the
/// stores, hence acquire/release ordering throughout.
#[derive(Debug, Default)]
pub struct LinkState {
    awaiting_ack: AtomicBool,
    last_ack: AtomicU8,
    suspended: AtomicBool,
}

impl LinkState {
    /// Called by the dispatcher right before transmitting a command.
    pub fn expect_ack(&self) {
        self.awaiting_ack.store(true, Ordering::Release);
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.awaiting_ack.load(Ordering::Acquire)
    }

    /// Consume one raw byte as the pending acknowledgement.
    pub fn record_ack(&self, byte: u8) {
        self.last_ack.store(byte, Ordering::Release);
        self.awaiting_ack.store(false, Ordering::Release);
    }

    pub fn last_ack(&self) -> u8 {
        self.last_ack.load(Ordering::Acquire)
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }
}

/// Stream codec for the fixed six byte telegram format.
///
/// Decoding resynchronizes on the domain byte; anything in front of it is
/// counted as skipped and only ever reported as a diagnostic. While a command
/// acknowledgement is pending the very next byte is consumed as the ACK, even
/// when it happens to equal the domain byte.
pub struct TelegramCodec {
    panel: u8,
    link: Arc<LinkState>,
    skipped: u64,
}

impl TelegramCodec {
    pub fn new(panel: u8, link: Arc<LinkState>) -> Self {
        Self { panel, link, skipped: 0 }
    }

    fn flush_skip_count(&mut self) {
        if self.skipped != 0 {
            debug!(message = "skipped bytes before frame start", count = self.skipped);
            self.skipped = 0;
        }
    }

    fn classify(&self, bytes: [u8; TELEGRAM_LENGTH]) -> Telegram {
        if checksum(&bytes) != bytes[5] {
            return Telegram::new(FrameState::CrcError, bytes);
        }
        match bytes[3] {
            SUSPEND_BYTE => {
                self.link.set_suspended(true);
                Telegram::new(FrameState::Suspend, bytes)
            }
            RESUME_BYTE => {
                self.link.set_suspended(false);
                Telegram::new(FrameState::Resume, bytes)
            }
            _ => {
                let receiver = bytes[2];
                if receiver == self.panel
                    || receiver == ADDRESS_ALL_PANELS
                    || receiver == ADDRESS_PANEL_1
                {
                    Telegram::new(FrameState::Ok, bytes)
                } else {
                    Telegram::new(FrameState::NotForUs, bytes)
                }
            }
        }
    }
}

impl Encoder<Telegram> for TelegramCodec {
    type Error = std::io::Error;

    fn encode(
        &mut self,
        telegram: Telegram,
        dst: &mut tokio_util::bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        dst.extend_from_slice(&telegram.bytes);
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for TelegramCodec {
    type Item = Telegram;
    type Error = std::io::Error;

    fn decode(
        &mut self,
        src: &mut tokio_util::bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(&first) = src.first() else {
                self.flush_skip_count();
                return Ok(None);
            };
            if self.link.is_awaiting_ack() {
                trace!(message = "consumed ACK byte", byte = format_args!("{first:02X}"));
                self.link.record_ack(first);
                src.advance(1);
                continue;
            }
            if first != DOMAIN {
                self.skipped += 1;
                src.advance(1);
                continue;
            }
            if src.len() < TELEGRAM_LENGTH {
                return Ok(None);
            }
            self.flush_skip_count();
            let mut bytes = [0u8; TELEGRAM_LENGTH];
            bytes.copy_from_slice(&src[..TELEGRAM_LENGTH]);
            src.advance(TELEGRAM_LENGTH);
            return Ok(Some(self.classify(bytes)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::bytes::BytesMut;

    fn codec() -> TelegramCodec {
        TelegramCodec::new(PANEL_ADDRESSES[0], Arc::new(LinkState::default()))
    }

    fn decode_all(codec: &mut TelegramCodec, bytes: &[u8]) -> Vec<Telegram> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(telegram) = codec.decode(&mut buf).unwrap() {
            out.push(telegram);
        }
        out
    }

    #[test]
    fn checksum_matches_emitted_byte() {
        for variable in [0x00u8, 0x29, 0x34, 0x71, 0xA3, 0xFF] {
            for value in [0x00u8, 0x01, 0x7F, 0x80, 0xFF] {
                let poll = Telegram::poll(PANEL_ADDRESSES[0], variable);
                assert_eq!(checksum(&poll.bytes), poll.checksum());
                let command = Telegram::command(PANEL_ADDRESSES[0], variable, value);
                assert_eq!(checksum(&command.bytes), command.checksum());
            }
        }
    }

    #[test]
    fn poll_roundtrips_through_the_codec() {
        let poll = Telegram::poll(panel_address(1).unwrap(), 0x29);
        assert_eq!(poll.state, FrameState::Poll);
        assert_eq!(poll.variable(), POLL_BYTE);
        assert_eq!(poll.value(), 0x29);
        assert_eq!(checksum(&poll.bytes), poll.checksum());

        // A frame the master sends back, addressed to panel 1.
        let mut reply = [DOMAIN, ADDRESS_MASTER, ADDRESS_PANEL_1, 0x29, 0x07, 0];
        reply[5] = checksum(&reply);
        let decoded = decode_all(&mut codec(), &reply);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].state, FrameState::Ok);
        assert_eq!(decoded[0].variable(), 0x29);
        assert_eq!(checksum(&decoded[0].bytes), decoded[0].checksum());
    }

    #[test]
    fn resynchronizes_on_domain_byte() {
        let mut frame = [DOMAIN, ADDRESS_MASTER, ADDRESS_ALL_PANELS, 0x34, 0xA0, 0];
        frame[5] = checksum(&frame);
        let mut stream = vec![0x55, 0xAA, 0x03];
        stream.extend_from_slice(&frame);
        let decoded = decode_all(&mut codec(), &stream);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].state, FrameState::Ok);
        assert_eq!(decoded[0].value(), 0xA0);
    }

    #[test]
    fn checksum_mismatch_is_not_fatal() {
        let mut bad = [DOMAIN, ADDRESS_MASTER, ADDRESS_PANEL_1, 0x29, 0x07, 0];
        bad[5] = checksum(&bad).wrapping_add(1);
        let mut good = [DOMAIN, ADDRESS_MASTER, ADDRESS_PANEL_1, 0x29, 0x07, 0];
        good[5] = checksum(&good);
        let mut stream = bad.to_vec();
        stream.extend_from_slice(&good);
        let decoded = decode_all(&mut codec(), &stream);
        assert_eq!(decoded[0].state, FrameState::CrcError);
        assert_eq!(decoded[1].state, FrameState::Ok);
    }

    #[test]
    fn frames_for_other_receivers_are_flagged() {
        let mut frame = [DOMAIN, ADDRESS_MASTER, 0x22, 0x29, 0x07, 0];
        frame[5] = checksum(&frame);
        let decoded = decode_all(&mut codec(), &frame);
        assert_eq!(decoded[0].state, FrameState::NotForUs);
    }

    #[test]
    fn pending_ack_consumes_next_byte_even_a_domain_byte() {
        let link = Arc::new(LinkState::default());
        let mut codec = TelegramCodec::new(PANEL_ADDRESSES[0], Arc::clone(&link));
        link.expect_ack();

        let mut frame = [DOMAIN, ADDRESS_MASTER, ADDRESS_PANEL_1, 0x29, 0x07, 0];
        frame[5] = checksum(&frame);
        let mut stream = vec![DOMAIN];
        stream.extend_from_slice(&frame);

        let decoded = decode_all(&mut codec, &stream);
        assert!(!link.is_awaiting_ack());
        assert_eq!(link.last_ack(), DOMAIN);
        // The ACK byte is swallowed; the frame behind it still decodes.
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].state, FrameState::Ok);
    }

    #[test]
    fn suspend_and_resume_toggle_the_shared_flag() {
        let link = Arc::new(LinkState::default());
        let mut codec = TelegramCodec::new(PANEL_ADDRESSES[0], Arc::clone(&link));

        let mut suspend = [DOMAIN, ADDRESS_MASTER, ADDRESS_ALL_PANELS, SUSPEND_BYTE, 0, 0];
        suspend[5] = checksum(&suspend);
        let decoded = decode_all(&mut codec, &suspend);
        assert_eq!(decoded[0].state, FrameState::Suspend);
        assert!(link.is_suspended());

        let mut resume = [DOMAIN, ADDRESS_MASTER, ADDRESS_ALL_PANELS, RESUME_BYTE, 0, 0];
        resume[5] = checksum(&resume);
        let decoded = decode_all(&mut codec, &resume);
        assert_eq!(decoded[0].state, FrameState::Resume);
        assert!(!link.is_suspended());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&[DOMAIN, ADDRESS_MASTER, ADDRESS_PANEL_1][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn panel_numbers_map_to_bus_addresses() {
        assert_eq!(panel_address(1), Some(0x21));
        assert_eq!(panel_address(8), Some(0x28));
        assert_eq!(panel_address(0), None);
        assert_eq!(panel_address(9), None);
    }
}
