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

//! Patch configuration: YAML descriptions of timbres and their samples.
//!
//! A patch file names timbres; each timbre is an ordered list of regions
//! binding a note/velocity range to a WAV file, a root note and an optional
//! envelope. Parsing and loading happen at startup, never on the audio path.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::timbre::{Envelope, MappedSample, Sample, Timbre};

mod loader;

pub use self::loader::SampleLoader;

/// Typed error for patch parse/load failures so callers can distinguish
/// e.g. a missing WAV from a malformed definition without string matching.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("Patch parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid patch: {0}")]
    Invalid(String),
}

/// A YAML representation of a set of timbres.
#[derive(Deserialize, Clone, Serialize, Debug)]
pub struct PatchConfig {
    /// Timbres by name.
    timbres: HashMap<String, TimbreConfig>,
}

/// A YAML representation of one timbre.
#[derive(Deserialize, Clone, Serialize, Debug)]
pub struct TimbreConfig {
    /// Ordered regions; the first region matching a note/velocity pair wins.
    regions: Vec<RegionConfig>,
}

/// A YAML representation of one timbre region.
#[derive(Deserialize, Clone, Serialize, Debug)]
pub struct RegionConfig {
    /// The WAV file for this region, relative to the patch file.
    file: String,

    /// MIDI note at which the sample plays at unity pitch.
    root: u8,

    /// Inclusive note bounds this region responds to.
    #[serde(default = "full_range")]
    note_range: [u8; 2],

    /// Inclusive velocity bounds this region responds to.
    #[serde(default = "full_range")]
    velocity_range: [u8; 2],

    /// Envelope and loop points. Absent means one-shot playback at constant
    /// gain.
    #[serde(default)]
    envelope: Option<EnvelopeConfig>,
}

fn full_range() -> [u8; 2] {
    [0, 127]
}

/// A YAML representation of ADSR coefficients and loop points.
#[derive(Deserialize, Clone, Copy, Serialize, Debug)]
pub struct EnvelopeConfig {
    /// Gain increment per envelope step during attack.
    pub attack: f32,
    /// Geometric factor per step approaching the sustain level.
    pub decay: f32,
    /// Sustain level as a fraction of peak volume.
    pub sustain: f32,
    /// Geometric factor per step during release.
    pub release: f32,
    /// First sample of the loop region.
    pub loop_start: usize,
    /// One past the last sample of the loop region.
    pub loop_end: usize,
}

impl From<EnvelopeConfig> for Envelope {
    fn from(config: EnvelopeConfig) -> Self {
        Envelope {
            attack: config.attack,
            decay: config.decay,
            sustain: config.sustain,
            release: config.release,
            loop_start: config.loop_start,
            loop_end: config.loop_end,
        }
    }
}

impl PatchConfig {
    /// Gets the configured timbres.
    pub fn timbres(&self) -> &HashMap<String, TimbreConfig> {
        &self.timbres
    }

    fn validate(&self) -> Result<(), PatchError> {
        for (name, timbre) in &self.timbres {
            if timbre.regions.is_empty() {
                return Err(PatchError::Invalid(format!(
                    "timbre {} has no regions",
                    name
                )));
            }
            for region in &timbre.regions {
                region.validate(name)?;
            }
        }
        Ok(())
    }
}

impl RegionConfig {
    fn validate(&self, timbre: &str) -> Result<(), PatchError> {
        let invalid = |what: String| PatchError::Invalid(format!("timbre {}: {}", timbre, what));

        if self.root > 127 {
            return Err(invalid(format!("root {} is not a MIDI note", self.root)));
        }
        for (axis, range) in [("note", self.note_range), ("velocity", self.velocity_range)] {
            if range[1] > 127 {
                return Err(invalid(format!("{} bound {} exceeds 127", axis, range[1])));
            }
            if range[0] > range[1] {
                return Err(invalid(format!(
                    "{} range [{}, {}] is inverted",
                    axis, range[0], range[1]
                )));
            }
        }
        if let Some(envelope) = &self.envelope {
            if !(envelope.attack > 0.0) {
                return Err(invalid("attack must be positive".to_string()));
            }
            for (what, value) in [("decay", envelope.decay), ("release", envelope.release)] {
                if !(value > 0.0 && value < 1.0) {
                    return Err(invalid(format!("{} {} is not in (0, 1)", what, value)));
                }
            }
            if !(0.0..=1.0).contains(&envelope.sustain) {
                return Err(invalid(format!(
                    "sustain {} is not in [0, 1]",
                    envelope.sustain
                )));
            }
            if envelope.loop_start >= envelope.loop_end {
                return Err(invalid(format!(
                    "loop region [{}, {}) is empty",
                    envelope.loop_start, envelope.loop_end
                )));
            }
        }
        Ok(())
    }
}

/// Parses and validates a patch definition from a YAML string.
pub fn parse_patch(yaml: &str) -> Result<PatchConfig, PatchError> {
    let config: PatchConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

/// Loads a patch file: parses the YAML and loads every referenced WAV into
/// memory, returning ready-to-bind timbres by name. File paths are resolved
/// relative to the patch file; regions referencing the same file share one
/// loaded copy.
pub fn load_patch(path: &Path) -> Result<HashMap<String, Arc<Timbre>>, PatchError> {
    let config = parse_patch(&fs::read_to_string(path)?)?;
    let base_path = path.parent().unwrap_or_else(|| Path::new("."));

    let mut loader = SampleLoader::new();
    let mut timbres = HashMap::new();
    for (name, timbre_config) in &config.timbres {
        let mut regions = Vec::with_capacity(timbre_config.regions.len());
        for region in &timbre_config.regions {
            let file_path = resolve(base_path, &region.file);
            let data = loader.load(&file_path)?;
            let length = data.len() - 1;

            let sample = match region.envelope {
                Some(envelope) => {
                    if envelope.loop_end > length {
                        return Err(PatchError::Invalid(format!(
                            "timbre {}: loop end {} exceeds sample length {} of {}",
                            name, envelope.loop_end, length, region.file
                        )));
                    }
                    Sample::looped_shared(data, region.root, envelope.into())
                }
                None => Sample::one_shot_shared(data, region.root),
            };
            regions.push(MappedSample::new(
                (region.note_range[0], region.note_range[1]),
                (region.velocity_range[0], region.velocity_range[1]),
                Arc::new(sample),
            ));
        }
        timbres.insert(name.clone(), Arc::new(Timbre::new(regions)));
    }

    info!(
        timbres = timbres.len(),
        memory_kb = loader.total_memory_usage() / 1024,
        "Patch loaded"
    );
    Ok(timbres)
}

fn resolve(base_path: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_path.join(path)
    }
}
