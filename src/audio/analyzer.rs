//! Frequency/amplitude summaries for visualization
//!
//! Reads the capture or playback tap, never the primary audio path. Frames
//! are computed on demand; consumers poll at their own redraw cadence.

use serde::{Deserialize, Serialize};

use crate::audio::buffer::SampleTap;

/// Which graph to analyze
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerSource {
    Capture,
    Playback,
}

/// Bucket layout of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    /// Every FFT bin up to Nyquist
    #[default]
    Frequency,
    /// Equal-tempered notes C1..B8
    Music,
    /// Notes within the speaking range
    Voice,
}

const NOTE_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
const VOICE_RANGE_HZ: (f32, f32) = (32.0, 2000.0);

/// Normalized amplitudes plus the buckets that produced them
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmplitudeFrame {
    /// One value in [0, 1] per bucket
    pub values: Vec<f32>,
    /// Center frequency of each bucket in Hz
    pub frequencies: Vec<f32>,
    pub labels: Vec<String>,
}

impl AmplitudeFrame {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Complex {
    re: f32,
    im: f32,
}

/// In-place iterative radix-2 FFT; `buf.len()` must be a power of two
fn fft(buf: &mut [Complex]) {
    let n = buf.len();
    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            buf.swap(i, j);
        }
    }

    let mut len = 2;
    while len <= n {
        let angle = -2.0 * std::f32::consts::PI / len as f32;
        let (w_re, w_im) = (angle.cos(), angle.sin());
        for start in (0..n).step_by(len) {
            let (mut cur_re, mut cur_im) = (1.0f32, 0.0f32);
            for k in 0..len / 2 {
                let a = buf[start + k];
                let b = buf[start + k + len / 2];
                let t_re = b.re * cur_re - b.im * cur_im;
                let t_im = b.re * cur_im + b.im * cur_re;
                buf[start + k] = Complex {
                    re: a.re + t_re,
                    im: a.im + t_im,
                };
                buf[start + k + len / 2] = Complex {
                    re: a.re - t_re,
                    im: a.im - t_im,
                };
                let next_re = cur_re * w_re - cur_im * w_im;
                cur_im = cur_re * w_im + cur_im * w_re;
                cur_re = next_re;
            }
        }
        len <<= 1;
    }
}

fn blackman(i: usize, n: usize) -> f32 {
    let x = 2.0 * std::f32::consts::PI * i as f32 / (n - 1) as f32;
    0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
}

/// Magnitude in dB of every bin up to Nyquist
fn spectrum_db(samples: &[f32]) -> Vec<f32> {
    let n = samples.len();
    let mut buf: Vec<Complex> = samples
        .iter()
        .enumerate()
        .map(|(i, &s)| Complex {
            re: s * blackman(i, n),
            im: 0.0,
        })
        .collect();
    fft(&mut buf);

    buf[..n / 2]
        .iter()
        .map(|c| {
            let magnitude = (c.re * c.re + c.im * c.im).sqrt() / n as f32;
            20.0 * magnitude.max(1e-12).log10()
        })
        .collect()
}

fn note_buckets(range: Option<(f32, f32)>) -> (Vec<f32>, Vec<String>) {
    let mut frequencies = Vec::new();
    let mut labels = Vec::new();
    // MIDI 24 = C1, 119 = B8
    for midi in 24..=119u32 {
        let hz = 440.0 * 2f32.powf((midi as f32 - 69.0) / 12.0);
        if let Some((lo, hi)) = range {
            if hz < lo || hz > hi {
                continue;
            }
        }
        frequencies.push(hz);
        labels.push(format!("{}{}", NOTE_NAMES[(midi % 12) as usize], midi / 12 - 1));
    }
    (frequencies, labels)
}

/// Snapshot spectral summaries of the capture and playback taps
#[derive(Clone)]
pub struct FrequencyAnalyzer {
    capture: SampleTap,
    playback: SampleTap,
    fft_size: usize,
}

impl FrequencyAnalyzer {
    pub fn new(capture: SampleTap, playback: SampleTap, fft_size: usize) -> Self {
        Self {
            capture,
            playback,
            fft_size: fft_size.next_power_of_two(),
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    fn buckets(&self, band: Band, sample_rate: u32) -> (Vec<f32>, Vec<String>) {
        match band {
            Band::Frequency => {
                let bin_hz = sample_rate as f32 / self.fft_size as f32;
                let frequencies: Vec<f32> = (0..self.fft_size / 2).map(|i| i as f32 * bin_hz).collect();
                let labels = frequencies.iter().map(|f| format!("{:.0} Hz", f)).collect();
                (frequencies, labels)
            }
            Band::Music => note_buckets(None),
            Band::Voice => note_buckets(Some(VOICE_RANGE_HZ)),
        }
    }

    /// Normalized amplitudes of the newest audio; all zeros when the source
    /// is not connected
    pub fn sample(&self, source: AnalyzerSource, band: Band, min_db: f32, max_db: f32) -> AmplitudeFrame {
        let tap = match source {
            AnalyzerSource::Capture => &self.capture,
            AnalyzerSource::Playback => &self.playback,
        };
        let sample_rate = tap.sample_rate();
        let (frequencies, labels) = self.buckets(band, sample_rate);

        let Some(samples) = tap.snapshot(self.fft_size) else {
            return AmplitudeFrame {
                values: vec![0.0; frequencies.len()],
                frequencies,
                labels,
            };
        };

        let db = spectrum_db(&samples);
        let bin_hz = sample_rate as f32 / self.fft_size as f32;
        let range = (max_db - min_db).max(f32::EPSILON);
        let normalize = |value: f32| ((value - min_db) / range).clamp(0.0, 1.0);

        let values = match band {
            Band::Frequency => db.iter().map(|&v| normalize(v)).collect(),
            Band::Music | Band::Voice => frequencies
                .iter()
                .map(|&hz| {
                    // Loudest bin within a quarter tone of the note
                    let lo = ((hz * 2f32.powf(-1.0 / 24.0)) / bin_hz).floor() as usize;
                    let hi = ((hz * 2f32.powf(1.0 / 24.0)) / bin_hz).ceil() as usize;
                    let nearest = ((hz / bin_hz).round() as usize).min(db.len() - 1);
                    let peak = db
                        .get(lo..=hi.min(db.len() - 1))
                        .and_then(|bins| bins.iter().copied().reduce(f32::max))
                        .unwrap_or(db[nearest]);
                    normalize(peak)
                })
                .collect(),
        };

        AmplitudeFrame {
            values,
            frequencies,
            labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::f32_to_i16;

    fn sine(freq: f32, rate: u32, n: usize) -> Vec<i16> {
        (0..n)
            .map(|i| f32_to_i16(0.8 * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin()))
            .collect()
    }

    fn analyzer() -> (FrequencyAnalyzer, SampleTap, SampleTap) {
        let capture = SampleTap::new(2048, 24_000);
        let playback = SampleTap::new(2048, 24_000);
        let analyzer = FrequencyAnalyzer::new(capture.clone(), playback.clone(), 1000);
        (analyzer, capture, playback)
    }

    #[test]
    fn test_disconnected_source_returns_zero_frame() {
        let (analyzer, _, _) = analyzer();
        assert_eq!(analyzer.fft_size(), 1024);

        let frame = analyzer.sample(AnalyzerSource::Playback, Band::Frequency, -100.0, -30.0);
        assert_eq!(frame.len(), 512);
        assert!(frame.values.iter().all(|&v| v == 0.0));

        let music = analyzer.sample(AnalyzerSource::Capture, Band::Music, -100.0, -30.0);
        assert_eq!(music.len(), 96);
        assert_eq!(music.labels[0], "C1");
        assert_eq!(music.labels[95], "B8");
    }

    #[test]
    fn test_sine_peaks_at_its_frequency() {
        let (analyzer, capture, _) = analyzer();
        capture.connect(24_000);
        capture.write(&sine(1_500.0, 24_000, 2048));

        let frame = analyzer.sample(AnalyzerSource::Capture, Band::Frequency, -120.0, 0.0);
        let peak = frame
            .values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert!((frame.frequencies[peak] - 1_500.0).abs() < 50.0, "peak at {}", frame.frequencies[peak]);
        assert!(frame.values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_voice_band_limits_range() {
        let (analyzer, _, playback) = analyzer();
        playback.connect(24_000);
        playback.write(&sine(440.0, 24_000, 1024));

        let frame = analyzer.sample(AnalyzerSource::Playback, Band::Voice, -120.0, 0.0);
        assert!(frame.frequencies.iter().all(|&f| (32.0..=2000.0).contains(&f)));
        let a4 = frame.labels.iter().position(|l| l == "A4").unwrap();
        let c2 = frame.labels.iter().position(|l| l == "C2").unwrap();
        assert!(frame.values[a4] > frame.values[c2]);
    }

    #[test]
    fn test_silence_normalizes_to_floor() {
        let (analyzer, capture, _) = analyzer();
        capture.connect(24_000);
        capture.write(&[0; 1024]);
        let frame = analyzer.sample(AnalyzerSource::Capture, Band::Frequency, -100.0, -30.0);
        assert!(frame.values.iter().all(|&v| v == 0.0));
    }
}
