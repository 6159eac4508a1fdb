// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Control messages and their transport to the audio thread.
//!
//! Producers push from any thread; the audio thread drains the queue to empty
//! at the top of each process call and dispatches each message after popping
//! it. Per-producer FIFO order is preserved; ordering across producers is
//! unspecified.

use crossbeam_channel::{Receiver, Sender};

/// A control event. Channel, note and bend values are already clamped/masked
/// by the public API before a message is enqueued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    NoteOn { channel: u8, note_no: u8, velocity: u8 },
    NoteOff { channel: u8, note_no: u8, velocity: u8 },
    PitchBend { channel: u8, bend: i16 },
}

/// FIFO from control threads to the audio thread.
pub(crate) struct MessageQueue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl MessageQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub(crate) fn push(&self, message: Message) {
        // Cannot fail: the receiver lives as long as the queue.
        let _ = self.tx.send(message);
    }

    pub(crate) fn pop(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new();
        queue.push(Message::NoteOn {
            channel: 0,
            note_no: 60,
            velocity: 100,
        });
        queue.push(Message::NoteOff {
            channel: 0,
            note_no: 60,
            velocity: 0,
        });
        queue.push(Message::PitchBend {
            channel: 1,
            bend: -100,
        });

        assert_eq!(
            queue.pop(),
            Some(Message::NoteOn {
                channel: 0,
                note_no: 60,
                velocity: 100
            })
        );
        assert_eq!(
            queue.pop(),
            Some(Message::NoteOff {
                channel: 0,
                note_no: 60,
                velocity: 0
            })
        );
        assert_eq!(
            queue.pop(),
            Some(Message::PitchBend {
                channel: 1,
                bend: -100
            })
        );
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_push_from_another_thread() {
        let queue = std::sync::Arc::new(MessageQueue::new());
        let producer = queue.clone();
        std::thread::spawn(move || {
            producer.push(Message::NoteOn {
                channel: 2,
                note_no: 40,
                velocity: 80,
            });
        })
        .join()
        .expect("producer thread panicked");

        assert_eq!(
            queue.pop(),
            Some(Message::NoteOn {
                channel: 2,
                note_no: 40,
                velocity: 80
            })
        );
    }
}
