//! Recording sinks
//!
//! [`WavFileSink`] encodes the relayed PCM into a WAV container on disk and can
//! stand in for the speaker sink. [`TeeSink`] feeds two sinks so a session can
//! be recorded alongside the live relay.

use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::audio::buffer::PcmChunk;
use crate::audio::format::{PcmFormat, SampleEncoding};
use crate::audio::playback::AudioSink;
use crate::error::AudioError;

/// WAV recorder implementing [`AudioSink`]
pub struct WavFileSink {
    label: String,
    recordings_dir: PathBuf,
    /// Path every session records to, for sinks made with [`WavFileSink::to_path`]
    fixed: Option<PathBuf>,
    /// Target of the next recording only, set by `start_encoding_to`
    target: Option<PathBuf>,
    format: Option<PcmFormat>,
    writer: Option<ActiveRecording>,
}

struct ActiveRecording {
    path: PathBuf,
    writer: WavWriter<BufWriter<File>>,
    encoding: SampleEncoding,
    bytes_written: u64,
}

impl WavFileSink {
    /// Create a recorder that generates file names under `recordings_dir`
    pub fn new(recordings_dir: impl AsRef<Path>) -> Self {
        Self {
            label: "wav".to_string(),
            recordings_dir: recordings_dir.as_ref().to_path_buf(),
            fixed: None,
            target: None,
            format: None,
            writer: None,
        }
    }

    /// Create a recorder that writes to one explicit path
    pub fn to_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut sink = Self::new(dir);
        sink.label = format!("wav:{}", path.display());
        sink.fixed = Some(path);
        sink
    }

    pub fn recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }

    /// Path of the recording in progress
    pub fn current_path(&self) -> Option<&Path> {
        self.writer.as_ref().map(|w| w.path.as_path())
    }

    pub fn is_encoding(&self) -> bool {
        self.writer.is_some()
    }

    /// Generate a unique filename for a new recording
    pub fn generate_filename(&self) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let uuid = uuid::Uuid::new_v4().to_string()[..8].to_string();
        self.recordings_dir
            .join(format!("relay_{}_{}.wav", timestamp, uuid))
    }

    /// Start encoding to `path`
    ///
    /// If the format is already known the file is opened now, otherwise on
    /// the next `init`. A recording already in progress is finalized first.
    pub fn start_encoding_to(&mut self, path: impl AsRef<Path>) -> Result<(), AudioError> {
        self.stop_encoding()?;
        self.target = Some(path.as_ref().to_path_buf());
        if let Some(format) = self.format {
            self.open(format)?;
        }
        Ok(())
    }

    /// Finalize the current recording, returning its path
    pub fn stop_encoding(&mut self) -> Result<Option<PathBuf>, AudioError> {
        let Some(active) = self.writer.take() else {
            return Ok(None);
        };
        active.writer.finalize()?;
        tracing::info!(
            "Recording finalized: {} ({} bytes of PCM)",
            active.path.display(),
            active.bytes_written
        );
        Ok(Some(active.path))
    }

    fn open(&mut self, format: PcmFormat) -> Result<(), AudioError> {
        let path = match self.target.take().or_else(|| self.fixed.clone()) {
            Some(path) => path,
            None => self.generate_filename(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| AudioError::DeviceOpen(format!("{}: {}", parent.display(), e)))?;
        }

        let spec = WavSpec {
            channels: format.channels.count(),
            sample_rate: format.sample_rate,
            bits_per_sample: format.encoding.bits_per_sample(),
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec)
            .map_err(|e| AudioError::DeviceOpen(format!("{}: {}", path.display(), e)))?;

        tracing::info!("Recording to {} ({})", path.display(), format);
        self.writer = Some(ActiveRecording {
            path,
            writer,
            encoding: format.encoding,
            bytes_written: 0,
        });
        Ok(())
    }
}

impl AudioSink for WavFileSink {
    fn name(&self) -> &str {
        &self.label
    }

    fn init(&mut self, format: PcmFormat) -> Result<(), AudioError> {
        self.stop_encoding()?;
        self.format = Some(format);
        self.open(format)
    }

    fn write(&mut self, chunk: PcmChunk) -> Result<(), AudioError> {
        let active = self.writer.as_mut().ok_or(AudioError::NotInitialized)?;
        let bytes = chunk.as_bytes();
        match active.encoding {
            SampleEncoding::Pcm16 => {
                for pair in bytes.chunks_exact(2) {
                    active.writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
                }
            }
            SampleEncoding::Pcm8 => {
                // hound takes 8-bit samples signed and stores them offset
                for &b in bytes {
                    active.writer.write_sample((b as i16 - 128) as i8)?;
                }
            }
        }
        active.bytes_written += bytes.len() as u64;
        Ok(())
    }

    fn release(&mut self) -> Result<(), AudioError> {
        self.stop_encoding()?;
        self.format = None;
        Ok(())
    }
}

/// Writes every chunk to a primary sink and a secondary sink
///
/// Used to record alongside the live relay. A failure on either side fails
/// the write.
pub struct TeeSink<A, B> {
    label: String,
    primary: A,
    secondary: B,
}

impl<A: AudioSink, B: AudioSink> TeeSink<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        let label = format!("{}+{}", primary.name(), secondary.name());
        Self {
            label,
            primary,
            secondary,
        }
    }

    pub fn primary(&self) -> &A {
        &self.primary
    }

    pub fn secondary(&self) -> &B {
        &self.secondary
    }
}

impl<A: AudioSink, B: AudioSink> AudioSink for TeeSink<A, B> {
    fn name(&self) -> &str {
        &self.label
    }

    fn init(&mut self, format: PcmFormat) -> Result<(), AudioError> {
        self.primary.init(format)?;
        if let Err(e) = self.secondary.init(format) {
            let _ = self.primary.release();
            return Err(e);
        }
        Ok(())
    }

    fn write(&mut self, chunk: PcmChunk) -> Result<(), AudioError> {
        self.secondary.write(chunk.clone())?;
        self.primary.write(chunk)
    }

    fn release(&mut self) -> Result<(), AudioError> {
        let primary = self.primary.release();
        let secondary = self.secondary.release();
        primary.and(secondary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::RecordingSink;
    use std::time::Duration;
    use tempfile::tempdir;

    fn chunk(samples: &[i16], seq: u64) -> PcmChunk {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        PcmChunk::new(bytes, seq, Duration::ZERO)
    }

    #[test]
    fn test_wav_sink_writes_readable_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let mut sink = WavFileSink::to_path(&path);
        sink.init(PcmFormat::mono16(16000)).unwrap();
        sink.write(chunk(&[1, -2, 3], 0)).unwrap();
        sink.write(chunk(&[4, 5], 1)).unwrap();
        sink.release().unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, -2, 3, 4, 5]);
    }

    #[test]
    fn test_start_encoding_while_open_switches_files() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a.wav");
        let second = dir.path().join("nested").join("b.wav");

        let mut sink = WavFileSink::to_path(&first);
        sink.init(PcmFormat::mono16(8000)).unwrap();
        sink.write(chunk(&[7], 0)).unwrap();

        sink.start_encoding_to(&second).unwrap();
        assert_eq!(sink.current_path(), Some(second.as_path()));
        sink.write(chunk(&[8, 9], 1)).unwrap();

        assert_eq!(sink.stop_encoding().unwrap(), Some(second.clone()));
        assert_eq!(sink.stop_encoding().unwrap(), None);

        assert_eq!(hound::WavReader::open(&first).unwrap().len(), 1);
        assert_eq!(hound::WavReader::open(&second).unwrap().len(), 2);
    }

    #[test]
    fn test_explicit_path_is_kept_across_sessions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("take.wav");

        let mut sink = WavFileSink::to_path(&path);
        sink.init(PcmFormat::mono16(8000)).unwrap();
        sink.write(chunk(&[1, 2, 3], 0)).unwrap();
        sink.release().unwrap();

        sink.init(PcmFormat::mono16(8000)).unwrap();
        assert_eq!(sink.current_path(), Some(path.as_path()));
        sink.write(chunk(&[4], 0)).unwrap();
        sink.release().unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(hound::WavReader::open(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_generated_filename_lives_in_recordings_dir() {
        let dir = tempdir().unwrap();
        let mut sink = WavFileSink::new(dir.path());
        sink.init(PcmFormat::mono16(8000)).unwrap();

        let path = sink.current_path().unwrap().to_path_buf();
        assert!(path.starts_with(dir.path()));
        assert_eq!(path.extension().unwrap(), "wav");
        sink.release().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_write_without_init_fails() {
        let mut sink = WavFileSink::new(".");
        assert_eq!(sink.write(chunk(&[1], 0)), Err(AudioError::NotInitialized));
    }

    #[test]
    fn test_tee_feeds_both_sinks() {
        let live = RecordingSink::new();
        let copy = RecordingSink::new();
        let live_log = live.log();
        let copy_log = copy.log();

        let mut tee = TeeSink::new(live, copy);
        tee.init(PcmFormat::mono16(16000)).unwrap();
        tee.write(chunk(&[1, 2], 0)).unwrap();
        tee.write(chunk(&[3, 4], 1)).unwrap();
        tee.release().unwrap();

        assert_eq!(live_log.sequences(), vec![0, 1]);
        assert_eq!(copy_log.sequences(), vec![0, 1]);
        assert_eq!(live_log.release_count(), 1);
        assert_eq!(copy_log.release_count(), 1);
    }
}
