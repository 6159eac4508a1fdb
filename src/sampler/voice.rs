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

//! The voice pool: allocation, stealing, and per-voice envelope state.

use std::sync::Arc;

use tracing::debug;

use crate::timbre::{Sample, VelocityTable};

use super::MAX_SOUND;

/// Envelope segment a voice is currently in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdsrState {
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Gain threshold below which a releasing voice is considered silent.
const SILENCE_THRESHOLD: f32 = 0.001;

/// One concurrently sounding copy of a sample.
///
/// A voice with `playing == false` is idle; its remaining fields (including
/// the sample reference) are stale and must not be read by the mixing pass.
pub struct SamplePlayer {
    pub(crate) sample: Option<Arc<Sample>>,
    pub(crate) note_no: u8,
    pub(crate) channel: u8,
    /// Target peak gain, derived from velocity.
    pub(crate) volume: f32,
    /// Current envelope output.
    pub(crate) gain: f32,
    /// Snapshot of the owning channel's bend, in semitones.
    pub(crate) pitch_bend: f32,
    /// Playback rate: `2^((note_no - root + pitch_bend) / 12)`.
    pub(crate) pitch: f32,
    /// Integer phase into the sample data.
    pub(crate) pos: usize,
    /// Fractional phase in `[0, 1)`.
    pub(crate) pos_f: f32,
    /// Voice-start tick for oldest-voice stealing.
    pub(crate) created_at: u64,
    /// Set by note-off; forces the release segment at the next envelope step.
    pub(crate) released: bool,
    pub(crate) playing: bool,
    pub(crate) adsr_state: AdsrState,
}

impl SamplePlayer {
    fn idle() -> Self {
        Self {
            sample: None,
            note_no: 0,
            channel: 0,
            volume: 0.0,
            gain: 0.0,
            pitch_bend: 0.0,
            pitch: 1.0,
            pos: 0,
            pos_f: 0.0,
            created_at: 0,
            released: false,
            playing: false,
            adsr_state: AdsrState::Attack,
        }
    }

    /// Re-arms this voice for a new note. Every field is rewritten so a
    /// stolen voice cannot keep stale note or channel attribution. A missing
    /// sample (no region matched) leaves the voice idle.
    fn reset(
        &mut self,
        sample: Option<Arc<Sample>>,
        note_no: u8,
        volume: f32,
        pitch_bend: f32,
        channel: u8,
        created_at: u64,
    ) {
        let adsr_enabled = sample.as_deref().is_some_and(|s| s.adsr_enabled);
        self.playing = sample.is_some();
        self.sample = sample;
        self.note_no = note_no;
        self.channel = channel;
        self.volume = volume;
        // Without an envelope the gain is pinned to the target volume.
        self.gain = if adsr_enabled { 0.0 } else { volume };
        self.pitch_bend = pitch_bend;
        self.pos = 0;
        self.pos_f = 0.0;
        self.created_at = created_at;
        self.released = false;
        self.adsr_state = AdsrState::Attack;
        self.update_pitch();
    }

    /// Recomputes the playback rate from the note, root and bend.
    pub(crate) fn update_pitch(&mut self) {
        let root = match self.sample.as_deref() {
            Some(sample) => sample.root,
            None => return,
        };
        let delta = self.note_no as f32 - root as f32 + self.pitch_bend;
        self.pitch = (delta / 12.0).exp2();
    }

    /// Advances the envelope by one step.
    ///
    /// A pending release request forces the release segment regardless of the
    /// current one. Attack ramps linearly to `volume`, decay approaches the
    /// sustain level geometrically and snaps when close, release decays
    /// geometrically and kills the voice once inaudible.
    pub(crate) fn update_gain(&mut self) {
        let (adsr_enabled, attack, decay, sustain, release) = match self.sample.as_deref() {
            Some(s) => (s.adsr_enabled, s.attack, s.decay, s.sustain, s.release),
            None => return,
        };

        if !adsr_enabled {
            self.gain = self.volume;
            return;
        }

        if self.released {
            self.adsr_state = AdsrState::Release;
        }

        match self.adsr_state {
            AdsrState::Attack => {
                self.gain += attack * self.volume;
                if self.gain >= self.volume {
                    self.gain = self.volume;
                    self.adsr_state = AdsrState::Decay;
                }
            }
            AdsrState::Decay => {
                let goal = sustain * self.volume;
                self.gain = (self.gain - goal) * decay + goal;
                if self.gain - goal < SILENCE_THRESHOLD {
                    self.adsr_state = AdsrState::Sustain;
                    self.gain = goal;
                }
            }
            AdsrState::Sustain => {}
            AdsrState::Release => {
                self.gain *= release;
                if self.gain < SILENCE_THRESHOLD {
                    self.gain = 0.0;
                    self.playing = false;
                }
            }
        }
    }
}

/// Fixed-size pool of voices with oldest-voice stealing.
pub struct VoicePool {
    pub(crate) players: [SamplePlayer; MAX_SOUND],
    velocity: VelocityTable,
    /// Monotonic voice-start tick.
    clock: u64,
}

impl VoicePool {
    pub(crate) fn new(velocity: VelocityTable) -> Self {
        Self {
            players: std::array::from_fn(|_| SamplePlayer::idle()),
            velocity,
            clock: 0,
        }
    }

    pub(crate) fn set_velocity_table(&mut self, velocity: VelocityTable) {
        self.velocity = velocity;
    }

    /// Picks a voice for a new note and resets it: the lowest-index idle
    /// voice if one exists, otherwise the oldest voice in the pool is stolen
    /// unconditionally. Returns the chosen slot.
    pub(crate) fn allocate(
        &mut self,
        sample: Option<Arc<Sample>>,
        note_no: u8,
        velocity: u8,
        pitch_bend: f32,
        channel: u8,
    ) -> usize {
        let slot = match self.players.iter().position(|p| !p.playing) {
            Some(free) => free,
            None => {
                let oldest = self
                    .players
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, p)| p.created_at)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                debug!(slot = oldest, note_no, channel, "Voice pool exhausted, stealing oldest voice");
                oldest
            }
        };

        let volume = self.velocity[(velocity & 0x7f) as usize];
        let created_at = self.clock;
        self.clock += 1;
        self.players[slot].reset(sample, note_no, volume, pitch_bend, channel, created_at);
        slot
    }

    /// Returns the number of currently sounding voices.
    pub(crate) fn active_count(&self) -> usize {
        self.players.iter().filter(|p| p.playing).count()
    }

    /// Silences every voice immediately, without release tails.
    pub(crate) fn stop_all(&mut self) {
        for player in self.players.iter_mut() {
            player.gain = 0.0;
            player.playing = false;
        }
    }
}
