//! Audio capture from the input device
//!
//! The cpal input callback converts whatever the device delivers into the
//! session encoding and hands the bytes to a dedicated capture thread, which
//! cuts them into fixed-size chunks and invokes the chunk callback in capture
//! order.

use bytes::Bytes;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Sample, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{PcmChunk, TransportBuffer};
use crate::audio::device::open_input;
use crate::audio::format::{PcmFormat, SampleEncoding};
use crate::constants::CAPTURE_QUEUE_DEPTH;
use crate::error::AudioError;

/// Receives every captured chunk; returning `Break` ends the capture loop
pub type ChunkCallback = Box<dyn FnMut(PcmChunk) -> ControlFlow<()> + Send>;

/// Receives the error that ended the capture loop
pub type ErrorCallback = Box<dyn FnOnce(AudioError) + Send>;

/// A producer of PCM chunks running on its own capture loop
pub trait AudioSource: Send {
    /// Human-readable name for logging
    fn name(&self) -> &str;

    /// Acquire the capture device and start the capture loop
    ///
    /// `on_chunk` is invoked for each chunk of exactly `chunk_size` bytes, in
    /// capture order. `on_error` is invoked at most once, after which the loop
    /// terminates.
    fn start(
        &mut self,
        format: PcmFormat,
        chunk_size: usize,
        on_chunk: ChunkCallback,
        on_error: ErrorCallback,
    ) -> Result<(), AudioError>;

    /// Stop the capture loop and release the device
    ///
    /// Blocks until the loop has exited. A no-op when not started.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Microphone capture through cpal
pub struct CpalSource {
    /// Configured device name, `None` for the host default
    device_name: Option<String>,

    label: String,

    /// Whether capture is running
    running: Arc<AtomicBool>,

    /// Capture thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Chunks emitted since the last start
    chunks_captured: Arc<AtomicU64>,

    /// Device buffers that could not be handed to the capture loop
    overruns: Arc<AtomicUsize>,
}

impl CpalSource {
    pub fn new(device_name: Option<String>) -> Self {
        let label = format!("mic:{}", device_name.as_deref().unwrap_or("default"));
        Self {
            device_name,
            label,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            chunks_captured: Arc::new(AtomicU64::new(0)),
            overruns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Chunks emitted since the last start
    pub fn chunks_captured(&self) -> u64 {
        self.chunks_captured.load(Ordering::Relaxed)
    }
}

impl AudioSource for CpalSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn start(
        &mut self,
        format: PcmFormat,
        chunk_size: usize,
        on_chunk: ChunkCallback,
        on_error: ErrorCallback,
    ) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Reap a loop that ended on its own
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }

        format.validate_chunk_size(chunk_size)?;
        let device = open_input(self.device_name.as_deref())?;
        let sample_format = device.negotiate(&format)?;

        let config = StreamConfig {
            channels: format.channels.count(),
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        self.chunks_captured.store(0, Ordering::SeqCst);
        self.overruns.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let ctx = CaptureLoop {
            running: self.running.clone(),
            chunks_captured: self.chunks_captured.clone(),
            overruns: self.overruns.clone(),
            chunk_size,
            on_chunk,
            on_error: Some(on_error),
        };
        let device_label = device.name.clone();

        let handle = thread::Builder::new()
            .name("capture-loop".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let (piece_tx, piece_rx) = bounded::<Bytes>(CAPTURE_QUEUE_DEPTH);
                let (err_tx, err_rx) = bounded::<AudioError>(4);

                let stream = match sample_format {
                    cpal::SampleFormat::I16 => build_input_stream::<i16>(
                        &cpal_device,
                        &config,
                        format.encoding,
                        piece_tx,
                        ctx.overruns.clone(),
                        err_tx,
                    ),
                    cpal::SampleFormat::U16 => build_input_stream::<u16>(
                        &cpal_device,
                        &config,
                        format.encoding,
                        piece_tx,
                        ctx.overruns.clone(),
                        err_tx,
                    ),
                    _ => build_input_stream::<f32>(
                        &cpal_device,
                        &config,
                        format.encoding,
                        piece_tx,
                        ctx.overruns.clone(),
                        err_tx,
                    ),
                };

                let stream = match stream.and_then(|s| {
                    s.play()
                        .map(|_| s)
                        .map_err(|e| AudioError::DeviceOpen(e.to_string()))
                }) {
                    Ok(stream) => stream,
                    Err(e) => {
                        ctx.running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                ctx.run(piece_rx, err_rx);

                // Stream is dropped here, releasing the device
                drop(stream);
            })
            .map_err(|e| AudioError::DeviceOpen(e.to_string()))?;
        self.thread_handle = Some(handle);

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::info!(
                    "Capture started on '{}' ({}, {} byte chunks)",
                    device_label,
                    format,
                    chunk_size
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.stop();
                Err(e)
            }
            Err(_) => {
                self.stop();
                Err(AudioError::DeviceOpen("capture thread exited during startup".into()))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Capture thread panicked");
            }
            tracing::info!("Capture stopped after {} chunks", self.chunks_captured());
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Next {
    Piece(Bytes),
    Failed(AudioError),
    Closed,
    Idle,
}

/// State owned by the capture thread
struct CaptureLoop {
    running: Arc<AtomicBool>,
    chunks_captured: Arc<AtomicU64>,
    overruns: Arc<AtomicUsize>,
    chunk_size: usize,
    on_chunk: ChunkCallback,
    on_error: Option<ErrorCallback>,
}

impl CaptureLoop {
    fn run(mut self, pieces: Receiver<Bytes>, errors: Receiver<AudioError>) {
        let started = Instant::now();
        let mut buffer = TransportBuffer::new(self.chunk_size);
        let mut sequence = 0u64;

        while self.running.load(Ordering::Relaxed) {
            let next = select! {
                recv(pieces) -> piece => match piece {
                    Ok(piece) => Next::Piece(piece),
                    Err(_) => Next::Closed,
                },
                recv(errors) -> err => match err {
                    Ok(err) => Next::Failed(err),
                    Err(_) => Next::Idle,
                },
                default(Duration::from_millis(10)) => Next::Idle,
            };

            match next {
                Next::Piece(piece) => {
                    let mut rest: &[u8] = &piece;
                    while !rest.is_empty() {
                        let n = buffer.fill_from(rest);
                        rest = &rest[n..];
                        if buffer.is_full() {
                            let chunk = buffer.take_chunk(sequence, started.elapsed());
                            sequence += 1;
                            self.chunks_captured.fetch_add(1, Ordering::Relaxed);
                            if (self.on_chunk)(chunk).is_break() {
                                self.running.store(false, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                }
                Next::Failed(err) => {
                    self.fail(err);
                    return;
                }
                Next::Closed => break,
                Next::Idle => {}
            }

            let dropped = self.overruns.load(Ordering::Relaxed);
            if dropped > 0 {
                self.fail(AudioError::CaptureOverrun(dropped));
                return;
            }
        }
    }

    fn fail(&mut self, err: AudioError) {
        tracing::error!("Capture failed: {}", err);
        self.running.store(false, Ordering::SeqCst);
        if let Some(on_error) = self.on_error.take() {
            on_error(err);
        }
    }
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    encoding: SampleEncoding,
    piece_tx: Sender<Bytes>,
    overruns: Arc<AtomicUsize>,
    err_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: cpal::FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mut bytes = Vec::with_capacity(data.len() * encoding.bytes_per_sample());
                for &sample in data {
                    encoding.encode(sample.to_sample::<f32>(), &mut bytes);
                }
                if piece_tx.try_send(Bytes::from(bytes)).is_err() {
                    overruns.fetch_add(1, Ordering::Relaxed);
                }
            },
            move |err| {
                let _ = err_tx.try_send(AudioError::StreamIo(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::DeviceOpen(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture_loop(chunk_size: usize) -> (CaptureLoop, Receiver<PcmChunk>, Receiver<AudioError>) {
        let (chunk_tx, chunk_rx) = crossbeam_channel::unbounded();
        let (err_tx, err_rx) = crossbeam_channel::unbounded();
        let ctx = CaptureLoop {
            running: Arc::new(AtomicBool::new(true)),
            chunks_captured: Arc::new(AtomicU64::new(0)),
            overruns: Arc::new(AtomicUsize::new(0)),
            chunk_size,
            on_chunk: Box::new(move |chunk| {
                let _ = chunk_tx.send(chunk);
                ControlFlow::Continue(())
            }),
            on_error: Some(Box::new(move |err| {
                let _ = err_tx.send(err);
            })),
        };
        (ctx, chunk_rx, err_rx)
    }

    #[test]
    fn test_loop_rechunks_device_buffers_in_order() {
        let (ctx, chunk_rx, _err_rx) = capture_loop(4);
        let (piece_tx, piece_rx) = bounded(8);
        let (_dev_err_tx, dev_err_rx) = bounded(1);

        piece_tx.send(Bytes::from_static(&[1, 2, 3])).unwrap();
        piece_tx.send(Bytes::from_static(&[4, 5, 6, 7, 8, 9])).unwrap();
        drop(piece_tx);
        ctx.run(piece_rx, dev_err_rx);

        let chunks: Vec<PcmChunk> = chunk_rx.try_iter().collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(chunks[1].as_bytes(), &[5, 6, 7, 8]);
        assert_eq!(chunks[0].sequence(), 0);
        assert_eq!(chunks[1].sequence(), 1);
    }

    #[test]
    fn test_loop_reports_device_error_once() {
        let (ctx, _chunk_rx, err_rx) = capture_loop(4);
        let running = ctx.running.clone();
        let (_piece_tx, piece_rx) = bounded::<Bytes>(1);
        let (dev_err_tx, dev_err_rx) = bounded(2);

        dev_err_tx.send(AudioError::StreamIo("unplugged".into())).unwrap();
        dev_err_tx.send(AudioError::StreamIo("again".into())).unwrap();
        ctx.run(piece_rx, dev_err_rx);

        let errors: Vec<AudioError> = err_rx.try_iter().collect();
        assert_eq!(errors, vec![AudioError::StreamIo("unplugged".into())]);
        assert!(!running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_loop_surfaces_overrun() {
        let (ctx, _chunk_rx, err_rx) = capture_loop(4);
        ctx.overruns.store(3, Ordering::SeqCst);
        let (_piece_tx, piece_rx) = bounded::<Bytes>(1);
        let (_dev_err_tx, dev_err_rx) = bounded(1);

        ctx.run(piece_rx, dev_err_rx);

        assert_eq!(err_rx.try_recv().unwrap(), AudioError::CaptureOverrun(3));
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let mut source = CpalSource::new(None);
        source.stop();
        source.stop();
        assert!(!source.is_running());
    }
}
