//! Audio device lifecycle service.
//!
//! The application owns one [`AudioManager`]. Every feature that needs
//! the speaker or microphone (a call, a ringtone, a prompt) starts the
//! manager with its own usage id and stops it when done; the device pair
//! is opened by the first usage and closed by the last.

use crate::device::DevicePair;
use crate::player::{Player, WavSource};
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reference counts per usage id.
#[derive(Debug, Default)]
struct UsageCounter {
    // ---
    counts: HashMap<i32, u32>,
}

impl UsageCounter {
    // ---
    /// Returns the new count for `usage_id`.
    fn obtain(&mut self, usage_id: i32) -> u32 {
        // ---
        let count = self.counts.entry(usage_id).or_insert(0);
        *count += 1;
        *count
    }

    /// Returns false when `usage_id` was not held.
    fn release(&mut self, usage_id: i32) -> bool {
        // ---
        match self.counts.get_mut(&usage_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.counts.remove(&usage_id);
                true
            }
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        // ---
        self.counts.is_empty()
    }
}

/// Owns the device pair and the file player.
pub struct AudioManager {
    // ---
    pair: Option<DevicePair>,
    player: Arc<Player>,
    usage: Mutex<UsageCounter>,
}

impl Default for AudioManager {
    fn default() -> Self {
        // ---
        Self::new()
    }
}

impl AudioManager {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            pair: None,
            player: Arc::new(Player::new()),
            usage: Mutex::new(UsageCounter::default()),
        }
    }

    /// Takes ownership of the device pair and attaches the player to it.
    pub fn init(&mut self, mut pair: DevicePair) {
        // ---
        self.shutdown();
        pair.set_player(Some(Arc::clone(&self.player)));
        self.pair = Some(pair);
        info!("Audio manager initialized");
    }

    /// Drops every usage, closes the devices and releases the pair.
    pub fn shutdown(&mut self) {
        // ---
        self.usage.lock().counts.clear();
        self.player.clear();
        self.player.release_played();

        if let Some(mut pair) = self.pair.take() {
            pair.stop();
            info!("Audio manager shut down");
        }
    }

    pub fn player(&self) -> &Arc<Player> {
        // ---
        &self.player
    }

    pub fn pair(&self) -> Option<&DevicePair> {
        // ---
        self.pair.as_ref()
    }

    /// True while any usage holds the devices open.
    pub fn is_active(&self) -> bool {
        // ---
        !self.usage.lock().is_empty()
    }

    pub fn usage_count(&self, usage_id: i32) -> u32 {
        // ---
        self.usage.lock().counts.get(&usage_id).copied().unwrap_or(0)
    }

    /// Registers a usage and opens the devices if it is the first.
    ///
    /// # Errors
    ///
    /// Returns error if the manager has no device pair or the devices
    /// fail to open. The usage is not counted in that case.
    pub fn start(&mut self, usage_id: i32) -> Result<()> {
        // ---
        let Some(pair) = self.pair.as_mut() else {
            bail!("audio manager is not initialized");
        };

        let mut usage = self.usage.lock();
        let first = usage.is_empty();
        let count = usage.obtain(usage_id);
        debug!("Start audio usage {} (count {})", usage_id, count);

        if first {
            if let Err(e) = pair.start() {
                usage.release(usage_id);
                return Err(e.context(format!("failed to start audio for usage {}", usage_id)));
            }
        }
        Ok(())
    }

    /// Releases a usage and its playlist items; closes the devices after
    /// the last one.
    pub fn stop(&mut self, usage_id: i32) {
        // ---
        self.player.release(usage_id);

        let mut usage = self.usage.lock();
        if !usage.release(usage_id) {
            warn!("Stop for unknown audio usage {}", usage_id);
            return;
        }
        debug!("Stop audio usage {}", usage_id);

        if usage.is_empty() {
            if let Some(pair) = self.pair.as_mut() {
                pair.stop();
            }
        }
    }

    /// Queues a WAV file and starts its usage.
    ///
    /// # Arguments
    ///
    /// * `usage_id` - Usage that owns the playback
    /// * `path` - WAV file; converted to the engine format on load
    /// * `looped` - Repeat until stopped or the time limit expires
    /// * `time_limit_ms` - Stop after this long; 0 plays to the end
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be loaded or the devices fail to
    /// open.
    pub fn start_play_file<P: AsRef<Path>>(
        &mut self,
        usage_id: i32,
        path: P,
        looped: bool,
        time_limit_ms: u32,
    ) -> Result<()> {
        // ---
        let path = path.as_ref();
        let source = WavSource::open(path)
            .with_context(|| format!("cannot play {}", path.display()))?;

        self.player.add(usage_id, Box::new(source), looped, time_limit_ms);
        if let Err(e) = self.start(usage_id) {
            self.player.release(usage_id);
            return Err(e);
        }
        Ok(())
    }

    pub fn stop_play_file(&mut self, usage_id: i32) {
        // ---
        self.stop(usage_id);
    }

    /// Services the devices and stops usages whose playback finished.
    pub fn process(&mut self) {
        // ---
        if let Some(pair) = self.pair.as_mut() {
            pair.pump();
        }

        for usage_id in self.player.release_played() {
            debug!("Playback finished for usage {}", usage_id);
            self.stop(usage_id);
        }
    }
}

impl Drop for AudioManager {
    fn drop(&mut self) {
        // ---
        self.shutdown();
    }
}
