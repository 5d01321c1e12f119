//! Devices without hardware, paced by a background timer.
//!
//! Used on machines without audio hardware and in tests: the output
//! device consumes one block per tick, the input device produces one
//! block of silence per tick.

use super::{InputDevice, OutputDevice};
use crate::config::{AUDIO_MIC_BUFFER_LENGTH, AUDIO_SPK_BUFFER_LENGTH};
use anyhow::{Context, Result};
use media_common::Format;
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Producer};
use ringbuf::{HeapCons, HeapProd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Ticks delivered at once before the timer gives up catching up.
const MAX_CATCH_UP_TICKS: u32 = 10;

/// Periodic callback on a dedicated thread.
///
/// Missed ticks are delivered late (up to a bound) so the average rate
/// matches the interval. Stopping signals a condition variable, so the
/// thread never sleeps past its next tick.
pub struct NullTimer {
    // ---
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl NullTimer {
    // ---
    /// Starts calling `tick` every `interval`.
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned.
    pub fn start<F>(name: &str, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        // ---
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let (lock, condvar) = &*signal;
                let mut next = Instant::now() + interval;

                loop {
                    {
                        let mut stopped = lock.lock();
                        while !*stopped && Instant::now() < next {
                            condvar.wait_until(&mut stopped, next);
                        }
                        if *stopped {
                            break;
                        }
                    }

                    let now = Instant::now();
                    let mut delivered = 0;
                    while next <= now && delivered < MAX_CATCH_UP_TICKS {
                        tick();
                        next += interval;
                        delivered += 1;
                    }
                    if next <= now {
                        next = now + interval;
                    }
                }
            })
            .with_context(|| format!("failed to spawn {} thread", name))?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the timer and joins its thread.
    pub fn stop(&mut self) {
        // ---
        let (lock, condvar) = &*self.stop;
        *lock.lock() = true;
        condvar.notify_all();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NullTimer {
    fn drop(&mut self) {
        // ---
        self.stop();
    }
}

/// Output device that discards audio in real time.
pub struct NullOutputDevice {
    // ---
    format: Format,
    timer: Option<NullTimer>,
    played_ms: Arc<AtomicU64>,
}

impl Default for NullOutputDevice {
    fn default() -> Self {
        // ---
        Self::new(Format::engine())
    }
}

impl NullOutputDevice {
    // ---
    pub fn new(format: Format) -> Self {
        // ---
        Self {
            format,
            timer: None,
            played_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Milliseconds consumed since creation.
    pub fn played_ms(&self) -> u64 {
        // ---
        self.played_ms.load(Ordering::Relaxed)
    }
}

impl OutputDevice for NullOutputDevice {
    fn open(&mut self, mut source: HeapCons<i16>) -> Result<()> {
        // ---
        self.close();

        let played = Arc::clone(&self.played_ms);
        let mut block = vec![0i16; self.format.samples_from_time(AUDIO_SPK_BUFFER_LENGTH)];

        self.timer = Some(NullTimer::start(
            "null-speaker",
            Duration::from_millis(AUDIO_SPK_BUFFER_LENGTH as u64),
            move || {
                source.pop_slice(&mut block);
                played.fetch_add(AUDIO_SPK_BUFFER_LENGTH as u64, Ordering::Relaxed);
            },
        )?);

        debug!("Null output opened ({})", self.format);
        Ok(())
    }

    fn close(&mut self) {
        // ---
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
            info!("Pseudoplayed {}ms", self.played_ms());
        }
    }

    fn format(&self) -> Format {
        // ---
        self.format
    }

    fn is_open(&self) -> bool {
        // ---
        self.timer.is_some()
    }
}

/// Input device that captures silence in real time.
pub struct NullInputDevice {
    // ---
    format: Format,
    timer: Option<NullTimer>,
    captured_ms: Arc<AtomicU64>,
}

impl Default for NullInputDevice {
    fn default() -> Self {
        // ---
        Self::new(Format::engine())
    }
}

impl NullInputDevice {
    // ---
    pub fn new(format: Format) -> Self {
        // ---
        Self {
            format,
            timer: None,
            captured_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn captured_ms(&self) -> u64 {
        // ---
        self.captured_ms.load(Ordering::Relaxed)
    }
}

impl InputDevice for NullInputDevice {
    fn open(&mut self, mut sink: HeapProd<i16>) -> Result<()> {
        // ---
        self.close();

        let captured = Arc::clone(&self.captured_ms);
        let silence = vec![0i16; self.format.samples_from_time(AUDIO_MIC_BUFFER_LENGTH)];

        self.timer = Some(NullTimer::start(
            "null-microphone",
            Duration::from_millis(AUDIO_MIC_BUFFER_LENGTH as u64),
            move || {
                sink.push_slice(&silence);
                captured.fetch_add(AUDIO_MIC_BUFFER_LENGTH as u64, Ordering::Relaxed);
            },
        )?);

        debug!("Null input opened ({})", self.format);
        Ok(())
    }

    fn close(&mut self) {
        // ---
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
            info!("Pseudocaptured {}ms", self.captured_ms());
        }
    }

    fn format(&self) -> Format {
        // ---
        self.format
    }

    fn is_open(&self) -> bool {
        // ---
        self.timer.is_some()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use ringbuf::traits::{Observer, Split};
    use ringbuf::HeapRb;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_timer_ticks_and_stops() {
        // ---
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);

        let mut timer = NullTimer::start("test-timer", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .expect("timer");

        thread::sleep(Duration::from_millis(100));
        timer.stop();
        let after_stop = ticks.load(Ordering::Relaxed);

        assert!(after_stop >= 5, "only {} ticks", after_stop);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::Relaxed), after_stop);
    }

    #[test]
    fn test_null_output_drains_ring() {
        // ---
        let (mut producer, consumer) = HeapRb::<i16>::new(16_000).split();
        producer.push_slice(&[1; 1600]);

        let mut device = NullOutputDevice::default();
        device.open(consumer).expect("open");
        assert!(device.is_open());

        thread::sleep(Duration::from_millis(60));
        device.close();
        device.close();

        assert!(!device.is_open());
        assert!(device.played_ms() >= 20);
        assert!(producer.occupied_len() < 1600);
    }

    #[test]
    fn test_null_input_fills_ring() {
        // ---
        let (producer, consumer) = HeapRb::<i16>::new(16_000).split();

        let mut device = NullInputDevice::default();
        device.open(producer).expect("open");
        thread::sleep(Duration::from_millis(60));
        device.close();

        assert!(consumer.occupied_len() >= 320);
        assert_eq!(consumer.occupied_len() % 160, 0);
        assert!(device.captured_ms() >= 20);
    }
}
