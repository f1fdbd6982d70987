//! Amplitude levels for the waveform view
//!
//! Turns a window of samples from the ring buffer into per-column bar
//! heights. Each display row has eight sub-levels (block glyph steps), so a
//! waveform `height` rows tall maps amplitudes onto `0..=height * 8`.

/// Sub-levels per display row
pub const LEVELS_PER_ROW: usize = 8;

/// Largest absolute amplitude in `samples`.
///
/// `i16::MIN` has no positive counterpart and is reported as `i16::MAX`.
pub fn max_abs_amplitude(samples: &[i16]) -> i16 {
    let mut max_amp = 0i16;
    for &s in samples {
        if s == i16::MIN {
            return i16::MAX;
        }
        max_amp = max_amp.max(s.abs());
    }
    max_amp
}

/// Map an amplitude onto `0..=max_level` with a square-root curve,
/// which keeps quiet speech visible.
pub fn amplitude_to_level(amp: i16, max_level: usize) -> usize {
    if amp <= 0 || max_level == 0 {
        return 0;
    }
    let normalized = amp as f64 / i16::MAX as f64;
    let scaled = normalized.sqrt() * max_level as f64;
    (scaled as usize).min(max_level)
}

/// Level per display column for a waveform `height` rows tall.
///
/// Samples are split into `width` equal buckets (left is older); columns
/// past the end of the samples are zero.
pub fn column_levels(samples: &[i16], width: usize, height: usize) -> Vec<usize> {
    let height = height.max(1);
    let max_level = height * LEVELS_PER_ROW;
    let mut levels = vec![0; width];
    if width == 0 {
        return levels;
    }

    let bucket = (samples.len() / width).max(1);
    for (col, level) in levels.iter_mut().enumerate() {
        let start = col * bucket;
        if start >= samples.len() {
            break;
        }
        let end = (start + bucket).min(samples.len());
        *level = amplitude_to_level(max_abs_amplitude(&samples[start..end]), max_level);
    }
    levels
}

/// Fill (0..=8) of one display row for a column at `level`.
/// Row 0 is the top row.
pub fn row_fill(level: usize, row: usize, height: usize) -> usize {
    let height = height.max(1);
    if row >= height {
        return 0;
    }
    let base = (height - 1 - row) * LEVELS_PER_ROW;
    level.saturating_sub(base).min(LEVELS_PER_ROW)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_abs_amplitude() {
        assert_eq!(max_abs_amplitude(&[]), 0);
        assert_eq!(max_abs_amplitude(&[1, -5, 3]), 5);
        assert_eq!(max_abs_amplitude(&[100, i16::MIN, 7]), i16::MAX);
        assert_eq!(max_abs_amplitude(&[-32767]), 32767);
    }

    #[test]
    fn test_amplitude_to_level_curve() {
        assert_eq!(amplitude_to_level(0, 16), 0);
        assert_eq!(amplitude_to_level(i16::MAX, 16), 16);
        // quarter amplitude lands at half height
        assert_eq!(amplitude_to_level(i16::MAX / 4, 16), 7);
        assert_eq!(amplitude_to_level(1000, 0), 0);
    }

    #[test]
    fn test_column_levels() {
        let mut samples = vec![0i16; 8];
        samples[6] = i16::MAX;
        let levels = column_levels(&samples, 4, 2);
        assert_eq!(levels, vec![0, 0, 0, 16]);

        // fewer samples than columns leaves trailing columns empty
        let levels = column_levels(&[i16::MIN], 3, 1);
        assert_eq!(levels, vec![8, 0, 0]);

        assert!(column_levels(&samples, 0, 1).is_empty());
    }

    #[test]
    fn test_row_fill() {
        // level 12 in a 2-row waveform: bottom row full, top row half
        assert_eq!(row_fill(12, 1, 2), 8);
        assert_eq!(row_fill(12, 0, 2), 4);
        assert_eq!(row_fill(0, 0, 2), 0);
        assert_eq!(row_fill(16, 0, 2), 8);
        assert_eq!(row_fill(16, 5, 2), 0);
    }
}
