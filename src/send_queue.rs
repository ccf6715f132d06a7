use crate::telegram::{FrameState, LinkState, Telegram};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Cadence of the dispatch tick. The bus is slow and the unit drops frames
/// when paced faster.
pub const DISPATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Transmissions attempted per command before giving up on its ACK.
pub const COMMAND_RETRIES: u8 = 5;

#[derive(Debug, Clone, Copy)]
struct QueueItem {
    telegram: Telegram,
    retries_left: u8,
    sent: bool,
}

/// What one dispatch tick decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Write this telegram to the transport.
    Write(Telegram),
    /// The pending command's checksum matched the last ACK byte.
    Acked(Telegram),
    /// Retry budget exhausted without a matching ACK.
    AckTimeout(Telegram),
}

/// Outgoing telegram queue.
///
/// Strictly FIFO for submissions, except that a command waiting for its ACK
/// is requeued at the front. Everything submitted after it waits until the
/// command is acknowledged or its retries run out, which keeps at most one
/// command in flight and preserves the device's ordering expectations.
#[derive(Debug, Default)]
pub struct SendQueue {
    items: VecDeque<QueueItem>,
}

impl SendQueue {
    pub fn submit(&mut self, telegram: Telegram) {
        match telegram.state {
            FrameState::Poll => {
                self.items.push_back(QueueItem { telegram, retries_left: 1, sent: false });
            }
            FrameState::Command => {
                self.items.push_back(QueueItem {
                    telegram,
                    retries_left: COMMAND_RETRIES,
                    sent: false,
                });
            }
            state => debug!(message = "refusing to queue inbound telegram", ?state),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// One dispatch tick. Never blocks; the caller performs the returned
    /// write. Returns `None` when traffic is suspended or nothing is due.
    pub fn tick(&mut self, link: &LinkState) -> Option<Dispatch> {
        if link.is_suspended() {
            trace!("traffic suspended, holding queue");
            return None;
        }
        let mut item = self.items.pop_front()?;
        match item.telegram.state {
            // Fire and forget.
            FrameState::Poll => Some(Dispatch::Write(item.telegram)),
            FrameState::Command => {
                if item.sent
                    && !link.is_awaiting_ack()
                    && link.last_ack() == item.telegram.checksum()
                {
                    debug!(message = "command acknowledged", telegram = %item.telegram);
                    return Some(Dispatch::Acked(item.telegram));
                }
                let Some(retries_left) = item.retries_left.checked_sub(1) else {
                    warn!(message = "ack not received", telegram = %item.telegram);
                    return Some(Dispatch::AckTimeout(item.telegram));
                };
                item.retries_left = retries_left;
                item.sent = true;
                link.expect_ack();
                // Head of the queue again until acknowledged or exhausted.
                self.items.push_front(item);
                Some(Dispatch::Write(item.telegram))
            }
            state => {
                debug!(message = "unexpected telegram in send queue", ?state);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::PANEL_ADDRESSES;

    const PANEL: u8 = PANEL_ADDRESSES[0];

    #[test]
    fn polls_transmit_once_in_submission_order() {
        let link = LinkState::default();
        let mut queue = SendQueue::default();
        let first = Telegram::poll(PANEL, 0x29);
        let second = Telegram::poll(PANEL, 0x34);
        queue.submit(first);
        queue.submit(second);

        assert_eq!(queue.tick(&link), Some(Dispatch::Write(first)));
        assert_eq!(queue.tick(&link), Some(Dispatch::Write(second)));
        assert_eq!(queue.tick(&link), None);
    }

    #[test]
    fn command_blocks_later_polls_until_acknowledged() {
        let link = LinkState::default();
        let mut queue = SendQueue::default();
        let command = Telegram::command(PANEL, 0x29, 0x07);
        let poll_one = Telegram::poll(PANEL, 0x32);
        let poll_two = Telegram::poll(PANEL, 0x33);
        queue.submit(command);
        queue.submit(poll_one);
        queue.submit(poll_two);

        // The command keeps the head of the queue across retries.
        assert_eq!(queue.tick(&link), Some(Dispatch::Write(command)));
        assert!(link.is_awaiting_ack());
        assert_eq!(queue.tick(&link), Some(Dispatch::Write(command)));

        link.record_ack(command.checksum());
        assert_eq!(queue.tick(&link), Some(Dispatch::Acked(command)));

        // Polls drain in submission order once the command resolves.
        assert_eq!(queue.tick(&link), Some(Dispatch::Write(poll_one)));
        assert_eq!(queue.tick(&link), Some(Dispatch::Write(poll_two)));
    }

    #[test]
    fn command_gives_up_after_its_retry_budget() {
        let link = LinkState::default();
        let mut queue = SendQueue::default();
        let command = Telegram::command(PANEL, 0x29, 0x07);
        let poll = Telegram::poll(PANEL, 0x32);
        queue.submit(command);
        queue.submit(poll);

        for _ in 0..COMMAND_RETRIES {
            assert_eq!(queue.tick(&link), Some(Dispatch::Write(command)));
        }
        assert_eq!(queue.tick(&link), Some(Dispatch::AckTimeout(command)));
        // The failure is per command, the rest of the queue lives on.
        assert_eq!(queue.tick(&link), Some(Dispatch::Write(poll)));
    }

    #[test]
    fn a_wrong_ack_byte_is_not_a_match() {
        let link = LinkState::default();
        let mut queue = SendQueue::default();
        let command = Telegram::command(PANEL, 0x29, 0x07);
        queue.submit(command);

        assert_eq!(queue.tick(&link), Some(Dispatch::Write(command)));
        link.record_ack(command.checksum().wrapping_add(1));
        assert_eq!(queue.tick(&link), Some(Dispatch::Write(command)));
    }

    #[test]
    fn suspension_halts_dispatch_entirely() {
        let link = LinkState::default();
        let mut queue = SendQueue::default();
        queue.submit(Telegram::poll(PANEL, 0x29));

        link.set_suspended(true);
        assert_eq!(queue.tick(&link), None);
        assert_eq!(queue.len(), 1);

        link.set_suspended(false);
        assert!(matches!(queue.tick(&link), Some(Dispatch::Write(_))));
    }
}
