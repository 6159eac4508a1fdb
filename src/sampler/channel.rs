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

//! Per-channel control state: timbre binding, pitch bend, held-note tracking.
//!
//! Channels do not own voices; they receive the voice pool by parameter and
//! reach voices through pool indices. A `playing_notes` entry records which
//! voice this channel believes is sounding for a held note; the voice may
//! have been stolen since, which the note-off and bend paths detect by
//! re-checking the voice's note and channel attribution.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::timbre::Timbre;

use super::voice::VoicePool;
use super::MAX_SOUND;

/// A note this channel started and has not yet released.
struct PlayingNote {
    note_no: u8,
    voice: usize,
}

pub(crate) struct Channel {
    /// This channel's index in the sampler's channel array, written once at
    /// construction and stamped into every voice it starts.
    index: u8,
    timbre: Option<Arc<Timbre>>,
    /// Current bend in semitones.
    pitch_bend: f32,
    playing_notes: Vec<PlayingNote>,
}

impl Channel {
    pub(crate) fn new(index: u8) -> Self {
        Self {
            index,
            timbre: None,
            pitch_bend: 0.0,
            playing_notes: Vec::with_capacity(MAX_SOUND),
        }
    }

    pub(crate) fn set_timbre(&mut self, timbre: Option<Arc<Timbre>>) {
        self.timbre = timbre;
    }

    /// Starts a note: resolves the sample from the timbre, allocates a voice
    /// and records the pairing. A timbre with no matching region still resets
    /// a voice (to idle), so the pool churns exactly as if the note sounded.
    pub(crate) fn note_on(&mut self, pool: &mut VoicePool, note_no: u8, velocity: u8) {
        let Some(timbre) = &self.timbre else {
            trace!(channel = self.index, note_no, "Note on ignored, no timbre bound");
            return;
        };
        debug!(channel = self.index, note_no, velocity, "Note on");

        let sample = timbre.sample_for(note_no, velocity).cloned();
        let voice = pool.allocate(sample, note_no, velocity, self.pitch_bend, self.index);
        self.playing_notes.push(PlayingNote { note_no, voice });
    }

    /// Releases every held entry for `note_no`. The entry is erased
    /// regardless; the voice itself is only flagged when its note and channel
    /// still match (i.e. it has not been stolen for another note since).
    pub(crate) fn note_off(&mut self, pool: &mut VoicePool, note_no: u8, _velocity: u8) {
        debug!(channel = self.index, note_no, "Note off");

        let index = self.index;
        self.playing_notes.retain(|entry| {
            if entry.note_no != note_no {
                return true;
            }
            let player = &mut pool.players[entry.voice];
            if player.note_no == note_no && player.channel == index {
                player.released = true;
            }
            false
        });
    }

    /// Applies a bend to this channel and to every tracked voice still owned
    /// by it. Raw 14-bit range maps linearly to +/-12 semitones.
    pub(crate) fn pitch_bend(&mut self, pool: &mut VoicePool, bend: i16) {
        self.pitch_bend = bend as f32 * 12.0 / 8192.0;

        for entry in &self.playing_notes {
            let player = &mut pool.players[entry.voice];
            if player.channel == self.index {
                player.pitch_bend = self.pitch_bend;
                player.update_pitch();
            }
        }
    }

    /// Forgets all held notes. Used when the whole pool is silenced.
    pub(crate) fn clear_notes(&mut self) {
        self.playing_notes.clear();
    }

    #[cfg(test)]
    pub(crate) fn held_note_count(&self) -> usize {
        self.playing_notes.len()
    }
}
