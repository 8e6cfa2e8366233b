//! Audio playback to the output device

use crossbeam::utils::Backoff;
use crossbeam_channel::{bounded, Receiver, Sender};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, StreamConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{create_shared_ring, PcmChunk, SharedChunkRing};
use crate::audio::device::open_output;
use crate::audio::format::{PcmFormat, SampleEncoding};
use crate::error::AudioError;

/// A consumer of PCM chunks
pub trait AudioSink: Send {
    /// Human-readable name for logging
    fn name(&self) -> &str;

    /// Open the output for `format`, reinitializing if already open
    fn init(&mut self, format: PcmFormat) -> Result<(), AudioError>;

    /// Write one chunk
    ///
    /// May block while the output is full. A chunk is never dropped
    /// silently: if it cannot be written the error is returned.
    fn write(&mut self, chunk: PcmChunk) -> Result<(), AudioError>;

    /// Flush pending audio and close the output. Idempotent.
    fn release(&mut self) -> Result<(), AudioError>;
}

impl<S: AudioSink + ?Sized> AudioSink for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn init(&mut self, format: PcmFormat) -> Result<(), AudioError> {
        (**self).init(format)
    }

    fn write(&mut self, chunk: PcmChunk) -> Result<(), AudioError> {
        (**self).write(chunk)
    }

    fn release(&mut self) -> Result<(), AudioError> {
        (**self).release()
    }
}

/// Speaker output through cpal
pub struct CpalSink {
    device_name: Option<String>,
    label: String,

    /// Ring capacity in chunks
    queue_chunks: usize,

    /// How long `write` may wait for room before failing
    stall_timeout: Duration,

    state: Option<PlaybackState>,
}

struct PlaybackState {
    format: PcmFormat,
    ring: SharedChunkRing,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Receiver<AudioError>,
    chunks_written: Arc<AtomicU64>,
    last_chunk_len: usize,
}

impl CpalSink {
    pub fn new(device_name: Option<String>, queue_chunks: usize) -> Self {
        let label = format!("speaker:{}", device_name.as_deref().unwrap_or("default"));
        Self {
            device_name,
            label,
            queue_chunks: queue_chunks.max(2),
            stall_timeout: Duration::from_secs(2),
            state: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }
}

impl AudioSink for CpalSink {
    fn name(&self) -> &str {
        &self.label
    }

    fn init(&mut self, format: PcmFormat) -> Result<(), AudioError> {
        if self.state.is_some() {
            self.release()?;
        }

        let device = open_output(self.device_name.as_deref())?;
        let sample_format = device.negotiate(&format)?;
        let device_label = device.name.clone();

        let config = StreamConfig {
            channels: format.channels.count(),
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let ring = create_shared_ring(self.queue_chunks);
        let running = Arc::new(AtomicBool::new(true));
        let (error_tx, error_rx) = bounded::<AudioError>(4);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let thread_ring = ring.clone();
        let thread_running = running.clone();
        let handle = thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let stream = match sample_format {
                    cpal::SampleFormat::I16 => build_output_stream::<i16>(
                        &cpal_device,
                        &config,
                        format.encoding,
                        thread_ring,
                        error_tx,
                    ),
                    cpal::SampleFormat::U16 => build_output_stream::<u16>(
                        &cpal_device,
                        &config,
                        format.encoding,
                        thread_ring,
                        error_tx,
                    ),
                    _ => build_output_stream::<f32>(
                        &cpal_device,
                        &config,
                        format.encoding,
                        thread_ring,
                        error_tx,
                    ),
                };

                let stream = match stream.and_then(|s| {
                    s.play()
                        .map(|_| s)
                        .map_err(|e| AudioError::DeviceOpen(e.to_string()))
                }) {
                    Ok(stream) => stream,
                    Err(e) => {
                        thread_running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive while running
                while thread_running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                drop(stream);
            })
            .map_err(|e| AudioError::DeviceOpen(e.to_string()))?;

        let startup = ready_rx
            .recv()
            .unwrap_or_else(|_| {
                Err(AudioError::DeviceOpen(
                    "playback thread exited during startup".into(),
                ))
            });
        if let Err(e) = startup {
            running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            return Err(e);
        }

        tracing::info!("Playback opened on '{}' ({})", device_label, format);
        self.state = Some(PlaybackState {
            format,
            ring,
            running,
            thread_handle: Some(handle),
            error_rx,
            chunks_written: Arc::new(AtomicU64::new(0)),
            last_chunk_len: 0,
        });
        Ok(())
    }

    fn write(&mut self, chunk: PcmChunk) -> Result<(), AudioError> {
        let state = self.state.as_mut().ok_or(AudioError::NotInitialized)?;

        if let Ok(err) = state.error_rx.try_recv() {
            return Err(err);
        }
        if !state.running.load(Ordering::Relaxed) {
            return Err(AudioError::StreamIo("playback stream is not running".into()));
        }

        let len = chunk.len();
        let deadline = Instant::now() + self.stall_timeout;
        let backoff = Backoff::new();
        let mut pending = chunk;
        loop {
            match state.ring.push(pending) {
                Ok(()) => break,
                Err(back) => {
                    if Instant::now() >= deadline {
                        return Err(AudioError::StreamIo(format!(
                            "playback stalled for {:?} with {} chunks queued",
                            self.stall_timeout,
                            state.ring.len()
                        )));
                    }
                    pending = back;
                    if backoff.is_completed() {
                        thread::sleep(Duration::from_millis(1));
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }

        state.last_chunk_len = len;
        state.chunks_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release(&mut self) -> Result<(), AudioError> {
        let Some(mut state) = self.state.take() else {
            return Ok(());
        };

        // Let queued audio drain before the stream is dropped
        let queued = state.ring.len() + 1;
        let drain_budget =
            state.format.duration_of(state.last_chunk_len * queued) + Duration::from_millis(200);
        let deadline = Instant::now() + drain_budget;
        while !state.ring.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if state.last_chunk_len > 0 {
            let tail = state.format.duration_of(state.last_chunk_len);
            thread::sleep(tail.min(Duration::from_millis(100)));
        }

        state.running.store(false, Ordering::SeqCst);
        let joined = state
            .thread_handle
            .take()
            .map(|h| h.join().is_ok())
            .unwrap_or(true);

        tracing::info!(
            "Playback released after {} chunks ({} underruns, {} chunks undrained)",
            state.chunks_written.load(Ordering::Relaxed),
            state.ring.underrun_count(),
            state.ring.len()
        );

        if joined {
            Ok(())
        } else {
            Err(AudioError::StreamIo("playback thread panicked".into()))
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    encoding: SampleEncoding,
    ring: SharedChunkRing,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let mut cursor = ChunkCursor::default();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                cursor.fill(data, encoding, &ring);
            },
            move |err| {
                let _ = error_tx.try_send(AudioError::StreamIo(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::DeviceOpen(e.to_string()))
}

/// Read position inside the chunk currently being played
#[derive(Default)]
struct ChunkCursor {
    current: Option<PcmChunk>,
    offset: usize,
}

impl ChunkCursor {
    /// Fill `out` from queued chunks, padding with silence on underrun
    fn fill<T: Sample + FromSample<f32>>(
        &mut self,
        out: &mut [T],
        encoding: SampleEncoding,
        ring: &SharedChunkRing,
    ) {
        let step = encoding.bytes_per_sample();
        let mut i = 0;
        while i < out.len() {
            let Some(chunk) = self.current.as_ref() else {
                match ring.pop() {
                    Some(next) => {
                        self.current = Some(next);
                        self.offset = 0;
                        continue;
                    }
                    None => {
                        out[i..].fill(T::EQUILIBRIUM);
                        return;
                    }
                }
            };

            let bytes = chunk.as_bytes();
            while i < out.len() && self.offset + step <= bytes.len() {
                out[i] = T::from_sample(encoding.decode(&bytes[self.offset..]));
                self.offset += step;
                i += 1;
            }
            if self.offset + step > bytes.len() {
                self.current = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_cursor_plays_chunks_across_callbacks() {
        let ring = create_shared_ring(4);
        ring.push(PcmChunk::new(pcm16(&[1, 2, 3]), 0, Duration::ZERO)).unwrap();
        ring.push(PcmChunk::new(pcm16(&[4, 5]), 1, Duration::ZERO)).unwrap();

        let mut cursor = ChunkCursor::default();
        let mut first = [0i16; 2];
        cursor.fill(&mut first, SampleEncoding::Pcm16, &ring);
        assert_eq!(first, [1, 2]);

        let mut second = [0i16; 4];
        cursor.fill(&mut second, SampleEncoding::Pcm16, &ring);
        assert_eq!(second, [3, 4, 5, 0]);
        assert_eq!(ring.underrun_count(), 1);
    }

    #[test]
    fn test_cursor_outputs_silence_when_empty() {
        let ring = create_shared_ring(2);
        let mut cursor = ChunkCursor::default();
        let mut out = [0.5f32; 3];
        cursor.fill(&mut out, SampleEncoding::Pcm16, &ring);
        assert_eq!(out, [0.0; 3]);
    }

    #[test]
    fn test_write_before_init_fails() {
        let mut sink = CpalSink::new(None, 4);
        let result = sink.write(PcmChunk::new(vec![0u8; 4], 0, Duration::ZERO));
        assert_eq!(result, Err(AudioError::NotInitialized));
    }

    #[test]
    fn test_release_is_idempotent_when_closed() {
        let mut sink = CpalSink::new(None, 4);
        assert!(sink.release().is_ok());
        assert!(sink.release().is_ok());
        assert!(!sink.is_initialized());
    }
}
