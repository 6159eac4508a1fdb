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

//! WAV sample loading and caching.
//!
//! Samples are loaded entirely into memory at patch-load time so voice
//! playback never touches storage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::PatchError;

/// Loads mono 16-bit WAV files and caches them by path, so several regions
/// referencing the same file share one in-memory copy.
pub struct SampleLoader {
    cache: HashMap<PathBuf, Arc<Vec<i16>>>,
}

impl SampleLoader {
    /// Creates an empty loader.
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    /// Loads a WAV file into memory, guard-padded for the interpolating
    /// kernel. Returns a cached copy if the file was loaded before.
    pub fn load(&mut self, path: &Path) -> Result<Arc<Vec<i16>>, PatchError> {
        if let Some(data) = self.cache.get(path) {
            debug!(path = ?path, "Using cached sample");
            return Ok(data.clone());
        }

        info!(path = ?path, "Loading sample into memory");
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        if spec.channels != 1 {
            return Err(PatchError::Invalid(format!(
                "{}: expected mono, got {} channels",
                path.display(),
                spec.channels
            )));
        }
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(PatchError::Invalid(format!(
                "{}: expected 16-bit integer PCM",
                path.display()
            )));
        }

        let mut pcm = reader
            .samples::<i16>()
            .collect::<Result<Vec<i16>, hound::Error>>()?;

        // The kernel reads one sample past the current position.
        let guard = pcm.last().copied().unwrap_or(0);
        pcm.push(guard);

        let data = Arc::new(pcm);
        self.cache.insert(path.to_path_buf(), data.clone());
        Ok(data)
    }

    /// Returns the total memory held by cached samples, in bytes.
    pub fn total_memory_usage(&self) -> usize {
        self.cache
            .values()
            .map(|data| data.len() * std::mem::size_of::<i16>())
            .sum()
    }
}

impl Default for SampleLoader {
    fn default() -> Self {
        Self::new()
    }
}
