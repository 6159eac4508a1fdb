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

//! The sampler: public control API and the per-period process loop.
//!
//! Control threads enqueue events through the message queue; the audio thread
//! calls [`Sampler::process`] once per buffer period, which drains the queue,
//! mixes every active voice into a float bus in envelope-step granularity,
//! runs the master effect and converts to 16-bit PCM.

mod channel;
mod message;
mod voice;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dsp::effect::{Bypass, MasterEffect};
use crate::dsp::kernel::{Kernel, KernelWork, PortableKernel};
use crate::dsp::output;
use crate::timbre::{linear_velocity_table, Timbre, VelocityTable};

use self::channel::Channel;
use self::message::{Message, MessageQueue};
use self::voice::VoicePool;

pub use self::voice::AdsrState;

/// Number of control channels.
pub const CH_COUNT: usize = 16;
/// Size of the voice pool: the maximum number of simultaneously sounding notes.
pub const MAX_SOUND: usize = 32;
/// Output samples written by every [`Sampler::process`] call.
pub const SAMPLE_BUFFER_SIZE: usize = 256;
/// Output samples per envelope step; voice gain is constant within a step.
pub const ADSR_UPDATE_SAMPLE_COUNT: usize = 32;

// The mixing pass slices the buffer into whole envelope steps, and the output
// converter works four-wide.
const _: () = assert!(SAMPLE_BUFFER_SIZE % ADSR_UPDATE_SAMPLE_COUNT == 0);
const _: () = assert!(SAMPLE_BUFFER_SIZE % 8 == 0);
const _: () = assert!(CH_COUNT >= 1 && CH_COUNT <= 128);

/// Envelope steps per buffer period.
const STEPS_PER_BUFFER: usize = SAMPLE_BUFFER_SIZE / ADSR_UPDATE_SAMPLE_COUNT;

/// Stack-allocated mix bus, aligned for SIMD loads in the output converter.
#[repr(align(16))]
struct MixBus([f32; SAMPLE_BUFFER_SIZE]);

/// Channels and the voice pool, guarded together by one mutex. Channels reach
/// voices through the pool passed by parameter, so there is no back-reference
/// from a channel to the sampler.
struct Engine {
    channels: [Channel; CH_COUNT],
    pool: VoicePool,
}

impl Engine {
    fn new(velocity: VelocityTable) -> Self {
        Self {
            channels: std::array::from_fn(|index| Channel::new(index as u8)),
            pool: VoicePool::new(velocity),
        }
    }

    fn dispatch(&mut self, message: Message) {
        match message {
            Message::NoteOn {
                channel,
                note_no,
                velocity,
            } => self.channels[channel as usize].note_on(&mut self.pool, note_no, velocity),
            Message::NoteOff {
                channel,
                note_no,
                velocity,
            } => self.channels[channel as usize].note_off(&mut self.pool, note_no, velocity),
            Message::PitchBend { channel, bend } => {
                self.channels[channel as usize].pitch_bend(&mut self.pool, bend)
            }
        }
    }

    /// Mixes every playing voice into the bus, one envelope step at a time.
    fn mix(&mut self, bus: &mut [f32; SAMPLE_BUFFER_SIZE], kernel: &dyn Kernel, master_volume: f32) {
        for player in self.pool.players.iter_mut() {
            if !player.playing {
                continue;
            }
            let Some(sample) = player.sample.clone() else {
                continue;
            };

            for step in 0..STEPS_PER_BUFFER {
                if sample.adsr_enabled {
                    player.update_gain();
                }
                if !player.playing {
                    break;
                }

                // The 65536 factor pre-applies the fixed-point step of the
                // output conversion.
                let gain = player.gain * master_volume * 65536.0;
                let dst =
                    &mut bus[step * ADSR_UPDATE_SAMPLE_COUNT..(step + 1) * ADSR_UPDATE_SAMPLE_COUNT];
                let mut work = KernelWork {
                    src: sample.data.as_slice(),
                    src_pos: player.pos,
                    dst,
                    pos_f: player.pos_f,
                    gain,
                    pitch: player.pitch,
                };
                kernel.mix(&mut work);

                // Without an envelope the whole sample plays once; with one,
                // the loop region repeats until release fades the voice out.
                let (loop_end, loop_back) = if sample.adsr_enabled {
                    (
                        sample.loop_end as i64,
                        sample.loop_start as i64 - sample.loop_end as i64,
                    )
                } else {
                    (sample.length as i64, 0)
                };

                let mut pos = work.src_pos as i64;
                if pos >= loop_end {
                    if loop_back == 0 {
                        player.playing = false;
                        break;
                    }
                    // A large enough pitch can overshoot the loop region by
                    // more than one loop length in a single kernel call.
                    while pos >= loop_end {
                        pos += loop_back;
                    }
                }
                player.pos = pos as usize;
                player.pos_f = work.pos_f;
            }
        }
    }
}

/// A polyphonic real-time sampler.
///
/// All control methods are callable from any thread; [`Sampler::process`] is
/// meant to be called from the audio thread once per buffer period.
pub struct Sampler {
    queue: MessageQueue,
    engine: Mutex<Engine>,
    effect: Mutex<Box<dyn MasterEffect + Send>>,
    kernel: Box<dyn Kernel>,
    /// f32 bits, so the control thread can update it without a lock.
    master_volume: AtomicU32,
}

impl Sampler {
    /// Creates a sampler with the portable kernel, a bypass master effect,
    /// the linear velocity table and unity master volume.
    pub fn new() -> Self {
        Self {
            queue: MessageQueue::new(),
            engine: Mutex::new(Engine::new(linear_velocity_table())),
            effect: Mutex::new(Box::new(Bypass)),
            kernel: Box::new(PortableKernel),
            master_volume: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    /// Replaces the master effect.
    pub fn with_effect(mut self, effect: Box<dyn MasterEffect + Send>) -> Self {
        *self.effect.get_mut() = effect;
        self
    }

    /// Replaces the resampling kernel with a platform-tuned implementation.
    pub fn with_kernel(mut self, kernel: Box<dyn Kernel>) -> Self {
        self.kernel = kernel;
        self
    }

    /// Replaces the velocity-to-gain table.
    pub fn with_velocity_table(mut self, table: VelocityTable) -> Self {
        self.engine.get_mut().pool.set_velocity_table(table);
        self
    }

    /// Enqueues a note-on. Velocity and note are masked to 7 bits; an
    /// out-of-range channel falls back to channel 0.
    pub fn note_on(&self, note_no: u8, velocity: u8, channel: u8) {
        let channel = if (channel as usize) < CH_COUNT { channel } else { 0 };
        self.queue.push(Message::NoteOn {
            channel,
            note_no: note_no & 0x7f,
            velocity: velocity & 0x7f,
        });
    }

    /// Enqueues a note-off. Same clamping as [`Sampler::note_on`].
    pub fn note_off(&self, note_no: u8, velocity: u8, channel: u8) {
        let channel = if (channel as usize) < CH_COUNT { channel } else { 0 };
        self.queue.push(Message::NoteOff {
            channel,
            note_no: note_no & 0x7f,
            velocity: velocity & 0x7f,
        });
    }

    /// Enqueues a pitch bend. The raw value is clamped to the 14-bit MIDI
    /// range; an out-of-range channel discards the event.
    pub fn pitch_bend(&self, bend: i16, channel: u8) {
        if (channel as usize) >= CH_COUNT {
            return;
        }
        self.queue.push(Message::PitchBend {
            channel,
            bend: bend.clamp(-8192, 8191),
        });
    }

    /// Binds a timbre to a channel, or unbinds with `None`. Already-sounding
    /// voices keep their sample references and are unaffected. A no-op for an
    /// out-of-range channel.
    pub fn set_timbre(&self, channel: u8, timbre: Option<Arc<Timbre>>) {
        if (channel as usize) >= CH_COUNT {
            return;
        }
        self.engine.lock().channels[channel as usize].set_timbre(timbre);
    }

    /// Sets the master volume applied to every voice during mixing.
    pub fn set_master_volume(&self, volume: f32) {
        self.master_volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    /// Returns the current master volume.
    pub fn master_volume(&self) -> f32 {
        f32::from_bits(self.master_volume.load(Ordering::Relaxed))
    }

    /// The audio callback: drains pending control messages, mixes all active
    /// voices, applies the master effect and writes one period of 16-bit PCM.
    pub fn process(&self, output: &mut [i16; SAMPLE_BUFFER_SIZE]) {
        // Messages are popped one at a time and dispatched outside the queue,
        // taking the engine lock per message.
        while let Some(message) = self.queue.pop() {
            self.engine.lock().dispatch(message);
        }

        let mut bus = MixBus([0.0; SAMPLE_BUFFER_SIZE]);
        let master_volume = self.master_volume();
        self.engine
            .lock()
            .mix(&mut bus.0, self.kernel.as_ref(), master_volume);

        self.effect.lock().process(&mut bus.0);
        output::write_pcm16(&bus.0, output);
    }

    /// Returns the number of currently sounding voices.
    pub fn active_voice_count(&self) -> usize {
        self.engine.lock().pool.active_count()
    }

    /// Silences every voice and forgets all held notes.
    pub fn stop_all(&self) {
        let mut engine = self.engine.lock();
        engine.pool.stop_all();
        for channel in engine.channels.iter_mut() {
            channel.clear_notes();
        }
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sampler")
            .field("active_voices", &self.active_voice_count())
            .field("master_volume", &self.master_volume())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        constant_sample, full_range_timbre, looped_sample, looped_sample_with_points,
    };

    fn process_once(sampler: &Sampler) -> [i16; SAMPLE_BUFFER_SIZE] {
        let mut output = [0i16; SAMPLE_BUFFER_SIZE];
        sampler.process(&mut output);
        output
    }

    #[test]
    fn test_empty_sampler_outputs_silence() {
        let sampler = Sampler::new();
        let output = process_once(&sampler);
        assert!(output.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_constant_sample_amplitude() {
        // Constant 0x4000 data at full velocity with master volume 0.5 lands
        // at 0x2000 on every output sample.
        let sampler = Sampler::new();
        sampler.set_timbre(0, Some(full_range_timbre(constant_sample(0x4000, 1024, 60))));
        sampler.set_master_volume(0.5);

        sampler.note_on(60, 127, 0);
        let output = process_once(&sampler);

        assert!(output.iter().all(|&s| s == 0x2000), "got {:?}", &output[..8]);
        assert_eq!(sampler.active_voice_count(), 1);
    }

    #[test]
    fn test_one_shot_voice_stops_at_sample_end() {
        let sampler = Sampler::new();
        // Exactly one buffer of data; the voice ends with it.
        sampler.set_timbre(
            0,
            Some(full_range_timbre(constant_sample(
                0x1000,
                SAMPLE_BUFFER_SIZE,
                60,
            ))),
        );

        sampler.note_on(60, 127, 0);
        process_once(&sampler);
        assert_eq!(sampler.active_voice_count(), 0);
    }

    #[test]
    fn test_note_off_releases_to_silence() {
        let sampler = Sampler::new();
        sampler.set_timbre(0, Some(full_range_timbre(looped_sample(512, 60))));

        sampler.note_on(60, 100, 0);
        process_once(&sampler);
        assert_eq!(sampler.active_voice_count(), 1);

        sampler.note_off(60, 0, 0);
        // Release halves the gain every envelope step; a few buffers suffice.
        for _ in 0..8 {
            process_once(&sampler);
            if sampler.active_voice_count() == 0 {
                break;
            }
        }
        assert_eq!(sampler.active_voice_count(), 0);
    }

    #[test]
    fn test_release_is_silent_after_decay() {
        let sampler = Sampler::new();
        sampler.set_timbre(0, Some(full_range_timbre(looped_sample(512, 60))));

        sampler.note_on(60, 100, 0);
        process_once(&sampler);
        sampler.note_off(60, 0, 0);
        for _ in 0..8 {
            process_once(&sampler);
        }

        let output = process_once(&sampler);
        assert!(output.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_voice_stealing_and_stale_note_off() {
        let sampler = Sampler::new();
        sampler.set_timbre(0, Some(full_range_timbre(looped_sample(512, 0))));

        // One more note than the pool holds; the first voice gets stolen.
        for note in 0..=MAX_SOUND as u8 {
            sampler.note_on(note, 100, 0);
        }
        process_once(&sampler);
        assert_eq!(sampler.active_voice_count(), MAX_SOUND);

        {
            let engine = sampler.engine.lock();
            assert_eq!(engine.pool.players[0].note_no, MAX_SOUND as u8);
        }

        // Note-off for the stolen note erases its entry but must not release
        // the voice now playing another note in its slot.
        sampler.note_off(0, 0, 0);
        process_once(&sampler);
        let engine = sampler.engine.lock();
        assert!(!engine.pool.players[0].released);
        assert!(engine.pool.players[0].playing);
    }

    #[test]
    fn test_loop_region_wraps_and_keeps_playing() {
        let sampler = Sampler::new();
        sampler.set_timbre(
            0,
            Some(full_range_timbre(looped_sample_with_points(256, 60, 100, 200))),
        );

        sampler.note_on(60, 100, 0);
        for _ in 0..16 {
            process_once(&sampler);
            let engine = sampler.engine.lock();
            let player = &engine.pool.players[0];
            assert!(player.playing);
            assert!(player.pos < 200, "pos {} escaped the loop region", player.pos);
        }
    }

    #[test]
    fn test_fast_pitch_wraps_loop_multiple_times_per_step() {
        let sampler = Sampler::new();
        // Tiny loop region, played two octaves above root: one envelope step
        // overshoots the loop length many times over.
        sampler.set_timbre(
            0,
            Some(full_range_timbre(looped_sample_with_points(256, 60, 190, 200))),
        );

        sampler.note_on(84, 100, 0);
        for _ in 0..8 {
            process_once(&sampler);
            let engine = sampler.engine.lock();
            let player = &engine.pool.players[0];
            assert!(player.playing);
            assert!(player.pos < 200);
        }
    }

    #[test]
    fn test_no_matching_region_drops_note() {
        let sampler = Sampler::new();
        // Region only covers velocities 100-127.
        let timbre = Timbre::new(vec![crate::timbre::MappedSample::new(
            (0, 127),
            (100, 127),
            looped_sample(256, 60),
        )]);
        sampler.set_timbre(0, Some(Arc::new(timbre)));

        sampler.note_on(60, 50, 0);
        let output = process_once(&sampler);
        assert_eq!(sampler.active_voice_count(), 0);
        assert!(output.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_velocity_is_masked_to_seven_bits() {
        let sampler = Sampler::new();
        sampler.set_timbre(0, Some(full_range_timbre(constant_sample(0x4000, 1024, 60))));

        // 128 & 0x7f == 0: the voice starts but the linear table gives zero gain.
        sampler.note_on(60, 128, 0);
        let output = process_once(&sampler);
        assert_eq!(sampler.active_voice_count(), 1);
        assert!(output.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_out_of_range_channel_remaps_to_zero_for_notes() {
        let sampler = Sampler::new();
        sampler.set_timbre(0, Some(full_range_timbre(looped_sample(512, 60))));

        sampler.note_on(60, 100, CH_COUNT as u8);
        process_once(&sampler);
        assert_eq!(sampler.active_voice_count(), 1);

        // ...and the matching note-off routes to channel 0 as well.
        sampler.note_off(60, 0, CH_COUNT as u8);
        for _ in 0..8 {
            process_once(&sampler);
        }
        assert_eq!(sampler.active_voice_count(), 0);
    }

    #[test]
    fn test_out_of_range_channel_discards_pitch_bend() {
        let sampler = Sampler::new();
        sampler.set_timbre(0, Some(full_range_timbre(looped_sample(512, 60))));

        sampler.note_on(60, 100, 0);
        process_once(&sampler);

        sampler.pitch_bend(4096, CH_COUNT as u8);
        process_once(&sampler);
        let engine = sampler.engine.lock();
        assert_eq!(engine.pool.players[0].pitch_bend, 0.0);
    }

    #[test]
    fn test_pitch_bend_raw_value_is_clamped() {
        let sampler = Sampler::new();
        sampler.set_timbre(0, Some(full_range_timbre(looped_sample(512, 60))));
        sampler.note_on(60, 100, 0);
        process_once(&sampler);

        sampler.pitch_bend(32767, 0);
        process_once(&sampler);
        {
            let engine = sampler.engine.lock();
            let bend = engine.pool.players[0].pitch_bend;
            assert!((bend - 8191.0 * 12.0 / 8192.0).abs() < 1e-4);
        }

        sampler.pitch_bend(-20000, 0);
        process_once(&sampler);
        let engine = sampler.engine.lock();
        assert_eq!(engine.pool.players[0].pitch_bend, -12.0);
    }

    #[test]
    fn test_pitch_bend_round_trip_restores_pitch() {
        let sampler = Sampler::new();
        sampler.set_timbre(0, Some(full_range_timbre(looped_sample(512, 48))));
        sampler.note_on(60, 100, 0);
        process_once(&sampler);

        let original = sampler.engine.lock().pool.players[0].pitch;
        sampler.pitch_bend(5000, 0);
        process_once(&sampler);
        sampler.pitch_bend(0, 0);
        process_once(&sampler);

        let restored = sampler.engine.lock().pool.players[0].pitch;
        assert_eq!(restored, original);
        // One octave above the root: unity bend leaves 2x playback rate.
        assert!((restored - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_master_effect_runs_on_mix_bus() {
        struct Doubler;
        impl MasterEffect for Doubler {
            fn process(&mut self, buffer: &mut [f32]) {
                for sample in buffer.iter_mut() {
                    *sample *= 2.0;
                }
            }
        }

        let sampler = Sampler::new().with_effect(Box::new(Doubler));
        sampler.set_timbre(0, Some(full_range_timbre(constant_sample(0x1000, 1024, 60))));
        sampler.set_master_volume(0.5);

        sampler.note_on(60, 127, 0);
        let output = process_once(&sampler);
        // 0x1000 * 0.5 * 2.0 == 0x1000.
        assert!(output.iter().all(|&s| s == 0x1000));
    }

    #[test]
    fn test_stop_all_silences_everything() {
        let sampler = Sampler::new();
        sampler.set_timbre(0, Some(full_range_timbre(looped_sample(512, 60))));
        for note in 60..68 {
            sampler.note_on(note, 100, 0);
        }
        process_once(&sampler);
        assert_eq!(sampler.active_voice_count(), 8);

        sampler.stop_all();
        assert_eq!(sampler.active_voice_count(), 0);
        let output = process_once(&sampler);
        assert!(output.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_events_from_control_thread_apply_next_period() {
        let sampler = Arc::new(Sampler::new());
        sampler.set_timbre(0, Some(full_range_timbre(looped_sample(512, 60))));

        let producer = sampler.clone();
        std::thread::spawn(move || {
            producer.note_on(60, 100, 0);
            producer.note_on(64, 100, 0);
        })
        .join()
        .expect("producer thread panicked");

        process_once(&sampler);
        assert_eq!(sampler.active_voice_count(), 2);
    }

    #[test]
    fn test_two_identical_note_ons_occupy_two_voices() {
        let sampler = Sampler::new();
        sampler.set_timbre(0, Some(full_range_timbre(looped_sample(512, 60))));

        sampler.note_on(60, 100, 0);
        sampler.note_on(60, 100, 0);
        process_once(&sampler);
        assert_eq!(sampler.active_voice_count(), 2);

        // A single note-off releases both entries for the note.
        sampler.note_off(60, 0, 0);
        for _ in 0..8 {
            process_once(&sampler);
        }
        assert_eq!(sampler.active_voice_count(), 0);
    }

    #[test]
    fn test_replacing_timbre_does_not_affect_sounding_voices() {
        let sampler = Sampler::new();
        sampler.set_timbre(0, Some(full_range_timbre(looped_sample(512, 60))));
        sampler.note_on(60, 100, 0);
        process_once(&sampler);

        sampler.set_timbre(0, None);
        process_once(&sampler);
        assert_eq!(sampler.active_voice_count(), 1);

        // New notes on the unbound channel are ignored.
        sampler.note_on(64, 100, 0);
        process_once(&sampler);
        assert_eq!(sampler.active_voice_count(), 1);
    }
}
