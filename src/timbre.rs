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

//! Sample data and timbres.
//!
//! A [`Sample`] is an immutable block of 16-bit PCM with playback metadata; a
//! [`Timbre`] maps note/velocity ranges onto samples. Both are shared between
//! voices via `Arc` and never mutated once built, so already-sounding voices
//! are unaffected when a channel switches timbres.

use std::sync::Arc;

/// Translates a raw MIDI velocity (0-127) to a target peak gain.
pub type VelocityTable = [f32; 128];

/// The default velocity curve: straight linear mapping to [0, 1].
pub fn linear_velocity_table() -> VelocityTable {
    std::array::from_fn(|v| v as f32 / 127.0)
}

/// ADSR envelope coefficients and loop points for a looped sample.
///
/// The coefficients are per envelope step, not per second: attack is the gain
/// increment, decay and release are the geometric factors applied each step.
#[derive(Clone, Copy, Debug)]
pub struct Envelope {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
    /// First sample of the loop region.
    pub loop_start: usize,
    /// One past the last sample of the loop region. A voice reaching this
    /// position wraps back by `loop_start - loop_end`.
    pub loop_end: usize,
}

/// An immutable, shareable block of mono 16-bit PCM.
///
/// The stored data always carries at least one guard sample past `length`
/// because the interpolating kernel reads `s[i]` and `s[i + 1]`.
pub struct Sample {
    pub(crate) data: Arc<Vec<i16>>,
    pub(crate) length: usize,
    pub(crate) root: u8,
    pub(crate) adsr_enabled: bool,
    pub(crate) attack: f32,
    pub(crate) decay: f32,
    pub(crate) sustain: f32,
    pub(crate) release: f32,
    pub(crate) loop_start: usize,
    pub(crate) loop_end: usize,
}

impl Sample {
    /// Creates a sample that plays once to its end at constant gain.
    pub fn one_shot(pcm: Vec<i16>, root: u8) -> Self {
        Self::one_shot_shared(Arc::new(Self::with_guard(pcm)), root)
    }

    /// Creates a looped, envelope-shaped sample.
    pub fn looped(pcm: Vec<i16>, root: u8, envelope: Envelope) -> Self {
        Self::looped_shared(Arc::new(Self::with_guard(pcm)), root, envelope)
    }

    /// Like [`Sample::one_shot`], but for data that is already guard-padded
    /// and shared (e.g. several regions referencing one loaded file).
    pub fn one_shot_shared(data: Arc<Vec<i16>>, root: u8) -> Self {
        debug_assert!(!data.is_empty());
        Self {
            length: data.len() - 1,
            data,
            root,
            adsr_enabled: false,
            attack: 0.0,
            decay: 0.0,
            sustain: 0.0,
            release: 0.0,
            loop_start: 0,
            loop_end: 0,
        }
    }

    /// Like [`Sample::looped`], but for data that is already guard-padded and
    /// shared.
    pub fn looped_shared(data: Arc<Vec<i16>>, root: u8, envelope: Envelope) -> Self {
        debug_assert!(!data.is_empty());
        debug_assert!(envelope.loop_end <= data.len() - 1);
        // An inverted region would make the playback wrap loop diverge.
        debug_assert!(envelope.loop_start <= envelope.loop_end);
        Self {
            length: data.len() - 1,
            data,
            root,
            adsr_enabled: true,
            attack: envelope.attack,
            decay: envelope.decay,
            sustain: envelope.sustain,
            release: envelope.release,
            loop_start: envelope.loop_start,
            loop_end: envelope.loop_end,
        }
    }

    /// Appends the guard sample the kernel's one-past-the-end read needs.
    fn with_guard(mut pcm: Vec<i16>) -> Vec<i16> {
        let guard = pcm.last().copied().unwrap_or(0);
        pcm.push(guard);
        pcm
    }

    /// Returns the number of valid samples (excluding guard padding).
    pub fn length(&self) -> usize {
        self.length
    }

    /// Returns the shared, guard-padded PCM data.
    pub fn data(&self) -> &Arc<Vec<i16>> {
        &self.data
    }

    /// Returns the MIDI note at which this sample plays at unity pitch.
    pub fn root(&self) -> u8 {
        self.root
    }
}

/// One region of a timbre: inclusive note and velocity bounds mapped to a
/// sample.
pub struct MappedSample {
    lower_note: u8,
    upper_note: u8,
    lower_velocity: u8,
    upper_velocity: u8,
    sample: Arc<Sample>,
}

impl MappedSample {
    /// Creates a region covering `note_range` x `velocity_range`, both
    /// inclusive on both ends.
    pub fn new(note_range: (u8, u8), velocity_range: (u8, u8), sample: Arc<Sample>) -> Self {
        Self {
            lower_note: note_range.0,
            upper_note: note_range.1,
            lower_velocity: velocity_range.0,
            upper_velocity: velocity_range.1,
            sample,
        }
    }

    fn matches(&self, note_no: u8, velocity: u8) -> bool {
        self.lower_note <= note_no
            && note_no <= self.upper_note
            && self.lower_velocity <= velocity
            && velocity <= self.upper_velocity
    }
}

/// An ordered set of mapped samples bound to a channel.
pub struct Timbre {
    samples: Vec<MappedSample>,
}

impl Timbre {
    /// Creates a timbre from an ordered list of regions.
    pub fn new(samples: Vec<MappedSample>) -> Self {
        Self { samples }
    }

    /// Picks the sample for a note/velocity pair. First match wins.
    pub fn sample_for(&self, note_no: u8, velocity: u8) -> Option<&Arc<Sample>> {
        self.samples
            .iter()
            .find(|ms| ms.matches(note_no, velocity))
            .map(|ms| &ms.sample)
    }
}
