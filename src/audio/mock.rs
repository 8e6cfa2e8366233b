//! Hardware-free source and sink for tests and dry runs.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::PcmChunk;
use crate::audio::capture::{AudioSource, ChunkCallback, ErrorCallback};
use crate::audio::format::PcmFormat;
use crate::audio::playback::AudioSink;
use crate::error::AudioError;

/// Observations shared between a [`ScriptedSource`] and the test holding it
#[derive(Default)]
pub struct SourceLog {
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    chunks_produced: AtomicUsize,
    running: AtomicBool,
    started_at: Mutex<Vec<Instant>>,
    format: Mutex<Option<PcmFormat>>,
}

impl SourceLog {
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn chunks_produced(&self) -> usize {
        self.chunks_produced.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// When each successful start happened
    pub fn started_at(&self) -> Vec<Instant> {
        self.started_at.lock().clone()
    }

    pub fn format(&self) -> Option<PcmFormat> {
        *self.format.lock()
    }
}

/// A source that plays back a fixed script of chunks at a fixed rate
///
/// After the script is exhausted it either repeats, reports a scripted
/// error, or idles until stopped.
pub struct ScriptedSource {
    script: Arc<Vec<Vec<u8>>>,
    interval: Duration,
    repeat: bool,
    fail_on_start: Option<AudioError>,
    fail_after_script: Option<AudioError>,
    log: Arc<SourceLog>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ScriptedSource {
    pub fn new(script: Vec<Vec<u8>>, interval: Duration) -> Self {
        Self {
            script: Arc::new(script),
            interval,
            repeat: false,
            fail_on_start: None,
            fail_after_script: None,
            log: Arc::new(SourceLog::default()),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// `count` chunks of `len` bytes, each filled with its index
    pub fn uniform(count: usize, len: usize, interval: Duration) -> Self {
        let script = (0..count).map(|i| vec![i as u8; len]).collect();
        Self::new(script, interval)
    }

    /// Produce chunks of `len` bytes until stopped
    pub fn continuous(len: usize, interval: Duration) -> Self {
        let mut source = Self::uniform(1, len, interval);
        source.repeat = true;
        source
    }

    pub fn failing_on_start(mut self, err: AudioError) -> Self {
        self.fail_on_start = Some(err);
        self
    }

    pub fn failing_after_script(mut self, err: AudioError) -> Self {
        self.fail_after_script = Some(err);
        self
    }

    pub fn log(&self) -> Arc<SourceLog> {
        self.log.clone()
    }
}

impl AudioSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn start(
        &mut self,
        format: PcmFormat,
        chunk_size: usize,
        mut on_chunk: ChunkCallback,
        on_error: ErrorCallback,
    ) -> Result<(), AudioError> {
        self.log.start_calls.fetch_add(1, Ordering::SeqCst);
        format.validate_chunk_size(chunk_size)?;
        if let Some(err) = self.fail_on_start.clone() {
            return Err(err);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }

        *self.log.format.lock() = Some(format);
        self.log.started_at.lock().push(Instant::now());
        self.log.running.store(true, Ordering::SeqCst);

        let script = self.script.clone();
        let interval = self.interval;
        let repeat = self.repeat;
        let failure = self.fail_after_script.clone();
        let log = self.log.clone();
        let running = self.running.clone();

        let handle = thread::Builder::new()
            .name("scripted-capture".to_string())
            .spawn(move || {
                let started = Instant::now();
                let mut sequence = 0u64;
                'script: loop {
                    for bytes in script.iter() {
                        thread::sleep(interval);
                        if !running.load(Ordering::SeqCst) {
                            break 'script;
                        }
                        let chunk = PcmChunk::new(bytes.clone(), sequence, started.elapsed());
                        sequence += 1;
                        log.chunks_produced.fetch_add(1, Ordering::SeqCst);
                        if on_chunk(chunk).is_break() {
                            break 'script;
                        }
                    }
                    if !repeat {
                        if let Some(err) = failure {
                            on_error(err);
                            break 'script;
                        }
                        while running.load(Ordering::SeqCst) {
                            thread::sleep(Duration::from_millis(1));
                        }
                        break 'script;
                    }
                }
                running.store(false, Ordering::SeqCst);
                log.running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| AudioError::DeviceOpen(e.to_string()))?;
        self.thread_handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.log.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.log.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Observations shared between a [`RecordingSink`] and the test holding it
#[derive(Default)]
pub struct SinkLog {
    chunks: Mutex<Vec<PcmChunk>>,
    init_calls: AtomicUsize,
    release_calls: AtomicUsize,
    open: AtomicBool,
    first_write_at: Mutex<Option<Instant>>,
}

impl SinkLog {
    pub fn write_count(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.chunks.lock().iter().map(PcmChunk::sequence).collect()
    }

    pub fn lengths(&self) -> Vec<usize> {
        self.chunks.lock().iter().map(PcmChunk::len).collect()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.chunks.lock().iter().map(|c| c.as_bytes().to_vec()).collect()
    }

    pub fn init_count(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    /// Whether the sink currently holds its output open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn first_write_at(&self) -> Option<Instant> {
        *self.first_write_at.lock()
    }
}

/// A sink that records every chunk it is given
pub struct RecordingSink {
    log: Arc<SinkLog>,
    fail_init: Option<AudioError>,
    /// Zero-based write index that fails
    fail_write_at: Option<usize>,
    fail_release: Option<AudioError>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            log: Arc::new(SinkLog::default()),
            fail_init: None,
            fail_write_at: None,
            fail_release: None,
        }
    }

    pub fn failing_init(mut self, err: AudioError) -> Self {
        self.fail_init = Some(err);
        self
    }

    pub fn failing_write_at(mut self, index: usize) -> Self {
        self.fail_write_at = Some(index);
        self
    }

    pub fn failing_release(mut self, err: AudioError) -> Self {
        self.fail_release = Some(err);
        self
    }

    pub fn log(&self) -> Arc<SinkLog> {
        self.log.clone()
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn init(&mut self, _format: PcmFormat) -> Result<(), AudioError> {
        self.log.init_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_init.clone() {
            return Err(err);
        }
        self.log.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn write(&mut self, chunk: PcmChunk) -> Result<(), AudioError> {
        if !self.log.is_open() {
            return Err(AudioError::NotInitialized);
        }
        let mut chunks = self.log.chunks.lock();
        if self.fail_write_at == Some(chunks.len()) {
            return Err(AudioError::StreamIo("scripted write failure".into()));
        }
        self.log.first_write_at.lock().get_or_insert_with(Instant::now);
        chunks.push(chunk);
        Ok(())
    }

    fn release(&mut self) -> Result<(), AudioError> {
        self.log.release_calls.fetch_add(1, Ordering::SeqCst);
        self.log.open.store(false, Ordering::SeqCst);
        match self.fail_release.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
