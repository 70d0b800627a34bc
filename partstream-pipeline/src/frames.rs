//! Mapping scene time onto a file sequence, and opening the selected frame

use glam::Vec3;
use partstream_core::{channels, Error, Interval, ParticleStream, Result, Schema, Time};
use partstream_parallel::{ParallelConcatConfig, ParallelConcatStream};
use partstream_readers::{
    open_stream, ConcatenatedStream, EmptyStream, FileSequence, LoadPolicy, Partition, PrtReaderOptions,
};
use partstream_transforms::{SetConstantStream, TimeInterpolateStream};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Sub-frame offsets smaller than this are treated as whole frames
const SUBFRAME_EPSILON: f64 = 1e-3;

/// What happens outside a limited frame range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RangeMode {
    /// No particles
    Blank,

    /// Repeat the first or last frame of the range
    #[default]
    Hold,
}

/// Inclusive range of frames to load from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    /// First frame
    pub start: i64,
    /// Last frame
    pub end: i64,
    /// Behaviour before `start`
    #[serde(default)]
    pub before: RangeMode,
    /// Behaviour after `end`
    #[serde(default)]
    pub after: RangeMode,
}

impl FrameRange {
    /// Whether the range holds a single frame
    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    fn contains(&self, frame: i64) -> bool {
        (self.start..=self.end).contains(&frame)
    }

    /// Clamp `frame` into the range, or `None` where the range is blank
    fn resolve(&self, frame: i64) -> Option<i64> {
        if frame < self.start {
            (self.before == RangeMode::Hold).then_some(self.start)
        } else if frame > self.end {
            (self.after == RangeMode::Hold).then_some(self.end)
        } else {
            Some(frame)
        }
    }
}

/// Mapping from scene time to sequence frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTiming {
    /// Scene frames per second
    pub fps: f64,
    /// Sequence frames advanced per scene frame
    pub rate: f64,
    /// Frames added after scaling
    pub offset: i64,
}

impl Default for FrameTiming {
    fn default() -> Self {
        Self {
            fps: 30.0,
            rate: 1.0,
            offset: 0,
        }
    }
}

/// Which frames to read for one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSample {
    /// Whole frame to load, `None` when nothing is shown
    pub frame: Option<i64>,

    /// Neighbouring frame to interpolate towards, `None` when not needed
    pub sibling: Option<i64>,

    /// Distance from `frame` to the exact sequence time, in frames, within
    /// `[-0.5, 0.5]`
    pub subframe: f64,

    /// Sequence frames per scene frame at this time
    pub time_derivative: f64,

    /// Whether the exact frame lies inside the range (always true without
    /// one)
    pub in_range: bool,

    /// Scene time interval over which this sample stays the same
    pub validity: Interval,
}

impl FrameSample {
    /// A sample for loading files as named, whatever the time
    pub fn still() -> Self {
        Self {
            frame: None,
            sibling: None,
            subframe: 0.0,
            time_derivative: 0.0,
            in_range: true,
            validity: Interval::FOREVER,
        }
    }

    /// Sub-frame offset converted to seconds, zero outside the range
    pub fn time_offset(&self, fps: f64) -> f64 {
        if self.in_range && fps > 0.0 {
            self.subframe / fps
        } else {
            0.0
        }
    }

    /// Whether the frames this sample reads are not moving
    pub fn is_static(&self) -> bool {
        self.time_derivative.abs() < 1e-4
    }
}

impl FrameTiming {
    /// Select frames for time `t`.
    ///
    /// `frame = round(t * fps * rate + offset)`; the interpolation sibling
    /// is the neighbour on the side of the exact position.
    pub fn sample(&self, t: Time, range: Option<&FrameRange>) -> FrameSample {
        let exact = t * self.fps * self.rate + self.offset as f64;
        let whole = exact.round();
        let mut subframe = exact - whole;
        let frame = whole as i64;
        let mut sibling = match subframe {
            s if s > SUBFRAME_EPSILON => Some(frame + 1),
            s if s < -SUBFRAME_EPSILON => Some(frame - 1),
            _ => None,
        };
        let mut time_derivative = self.rate;
        let mut in_range = true;

        let frame = match range {
            Some(range) => {
                in_range = range.contains(frame);
                let resolved = range.resolve(frame);
                if !in_range {
                    subframe = 0.0;
                    sibling = None;
                    time_derivative = 0.0;
                } else if let Some(s) = sibling {
                    if !range.contains(s) {
                        // A blank or held neighbour has nothing to move towards
                        sibling = None;
                        if range.resolve(s).is_none() {
                            subframe = 0.0;
                        }
                    }
                }
                resolved
            }
            None => Some(frame),
        };

        let validity = if self.rate == 0.0 { Interval::FOREVER } else { Interval::instant(t) };
        FrameSample {
            frame,
            sibling,
            subframe,
            time_derivative,
            in_range,
            validity,
        }
    }
}

/// How the frames of a sequence are opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceOptions {
    /// Failure policy for missing or corrupt files
    pub policy: LoadPolicy,

    /// Read partitions on parallel threads; record order across partitions
    /// is then unspecified
    pub parallel: bool,

    /// Threading for parallel reads
    pub concat: ParallelConcatConfig,

    /// Buffer size for file I/O
    pub buffer_size: usize,
}

impl Default for SequenceOptions {
    fn default() -> Self {
        Self {
            policy: LoadPolicy::Strict,
            parallel: true,
            concat: ParallelConcatConfig::default(),
            buffer_size: PrtReaderOptions::default().buffer_size,
        }
    }
}

impl SequenceOptions {
    fn reader(&self) -> PrtReaderOptions {
        PrtReaderOptions {
            policy: self.policy,
            buffer_size: self.buffer_size,
        }
    }
}

/// Open every partition of `frame` and combine them into one stream.
///
/// With `interpolation` set to `(sibling, factor)`, each partition is
/// blended with the same partition of the sibling frame. Files that name a partition get
/// `PartitionIndex` and `PartitionCount` channels. A frame with no files is
/// a source error under the strict policy and an empty stream of `fallback`
/// under the lenient one.
pub fn open_frame(
    sequence: &FileSequence,
    frame: i64,
    interpolation: Option<(i64, f32)>,
    options: &SequenceOptions,
    fallback: &Schema,
) -> Result<Box<dyn ParticleStream>> {
    let partitions = if options.policy == LoadPolicy::Lenient {
        sequence.existing_partitions(frame)
    } else {
        sequence.partition_paths(frame)
    };
    if partitions.is_empty() {
        warn!(frame, dir = %sequence.dir().display(), "no particle files for frame, loading nothing");
        return Ok(Box::new(EmptyStream::new(fallback.clone())));
    }

    let mut streams = Vec::with_capacity(partitions.len());
    for (partition, path) in partitions {
        let mut stream = open_stream(&path, options.reader())?;
        if let Some((sibling, factor)) = interpolation {
            let other = sequence.path_for(sibling, partition.map(|p| p.index));
            let other = open_stream(&other, options.reader())?;
            stream = Box::new(TimeInterpolateStream::new(stream, other, f64::from(factor))?);
        }
        if let Some(partition) = partition {
            stream = with_partition(stream, partition)?;
        }
        streams.push(stream);
    }
    debug!(frame, partitions = streams.len(), interpolated = interpolation.is_some(), "opened frame");

    Ok(match streams.len() {
        1 => streams.remove(0),
        _ if options.parallel => Box::new(ParallelConcatStream::new(streams, options.concat.clone())),
        _ => Box::new(ConcatenatedStream::new(streams)),
    })
}

fn with_partition(stream: Box<dyn ParticleStream>, partition: Partition) -> Result<Box<dyn ParticleStream>> {
    let index = i32::try_from(partition.index).map_err(|_| Error::InvalidArgument("partition index".into()))?;
    let count = i32::try_from(partition.count).map_err(|_| Error::InvalidArgument("partition count".into()))?;
    let stream = SetConstantStream::new(stream, channels::PARTITION_INDEX, index)?;
    Ok(Box::new(SetConstantStream::new(stream, channels::PARTITION_COUNT, count)?))
}

/// Velocity of zero, used when a sequence does not move
pub(crate) fn zero_velocity(stream: Box<dyn ParticleStream>) -> Result<Box<dyn ParticleStream>> {
    Ok(Box::new(SetConstantStream::new(stream, channels::VELOCITY, Vec3::ZERO)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use partstream_core::{Channel, NullProgress, ParticleArray, Schema};
    use partstream_readers::{write_stream, ArrayStream, PrtWriterOptions};
    use std::path::Path;
    use test_case::test_case;

    fn timing() -> FrameTiming {
        FrameTiming {
            fps: 10.0,
            rate: 1.0,
            offset: 0,
        }
    }

    #[test_case(0.0, Some(0), None ; "whole frame")]
    #[test_case(0.13, Some(1), Some(2) ; "after a frame")]
    #[test_case(0.17, Some(2), Some(1) ; "before a frame")]
    fn test_sample_siblings(t: Time, frame: Option<i64>, sibling: Option<i64>) {
        let sample = timing().sample(t, None);
        assert_eq!((sample.frame, sample.sibling), (frame, sibling));
        assert!(sample.subframe.abs() <= 0.5);
    }

    #[test]
    fn test_sample_rate_and_offset() {
        let timing = FrameTiming {
            fps: 10.0,
            rate: 2.0,
            offset: 5,
        };
        let sample = timing.sample(1.0, None);
        assert_eq!(sample.frame, Some(25));
        assert_eq!(sample.time_derivative, 2.0);
    }

    #[test_case(RangeMode::Blank, RangeMode::Blank, 0.0, None ; "blank before")]
    #[test_case(RangeMode::Hold, RangeMode::Blank, 0.0, Some(3) ; "hold before")]
    #[test_case(RangeMode::Hold, RangeMode::Blank, 1.0, None ; "blank after")]
    #[test_case(RangeMode::Blank, RangeMode::Hold, 1.0, Some(6) ; "hold after")]
    #[test_case(RangeMode::Blank, RangeMode::Blank, 0.5, Some(5) ; "inside")]
    fn test_range_modes(before: RangeMode, after: RangeMode, t: Time, frame: Option<i64>) {
        let range = FrameRange {
            start: 3,
            end: 6,
            before,
            after,
        };
        let sample = timing().sample(t, Some(&range));
        assert_eq!(sample.frame, frame);
        assert_eq!(sample.in_range, frame == Some(5));
    }

    #[test]
    fn test_sibling_past_blank_range_end() {
        let range = FrameRange {
            start: 0,
            end: 1,
            before: RangeMode::Blank,
            after: RangeMode::Blank,
        };
        let sample = timing().sample(0.13, Some(&range));
        assert_eq!((sample.frame, sample.sibling, sample.subframe), (Some(1), None, 0.0));
    }

    #[test]
    fn test_static_sequence_is_valid_forever() {
        let timing = FrameTiming {
            fps: 30.0,
            rate: 0.0,
            offset: 7,
        };
        let sample = timing.sample(12.0, None);
        assert_eq!(sample.frame, Some(7));
        assert!(sample.is_static());
        assert_eq!(sample.validity, Interval::FOREVER);
    }

    fn write_frame(path: &Path, xs: &[f32]) {
        let schema = Schema::new(vec![Channel::of::<Vec3>("Position")]).unwrap();
        let position = schema.get_accessor::<Vec3>("Position").unwrap();
        let mut array = ParticleArray::new(schema.clone());
        for x in xs {
            let mut record = schema.default_record();
            position.set(&mut record, Vec3::new(*x, 0.0, 0.0));
            array.push(&record).unwrap();
        }
        write_stream(path, &mut ArrayStream::from_array(array), &NullProgress, PrtWriterOptions::default()).unwrap();
    }

    #[test]
    fn test_open_partitioned_frame() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(&dir.path().join("cloud_part1of2_0004.prt"), &[1.0, 2.0]);
        write_frame(&dir.path().join("cloud_part2of2_0004.prt"), &[3.0]);
        let sequence = FileSequence::parse(dir.path().join("cloud_part1of2_0000.prt")).unwrap();
        let options = SequenceOptions {
            parallel: false,
            ..SequenceOptions::default()
        };

        let mut stream = open_frame(&sequence, 4, None, &options, &Schema::empty()).unwrap();
        let requested = Schema::new(vec![
            Channel::of::<Vec3>("Position"),
            Channel::of::<i32>("PartitionIndex"),
            Channel::of::<i32>("PartitionCount"),
        ])
        .unwrap();
        stream.set_schema(&requested).unwrap();
        let out = ParticleArray::from_stream(stream.as_mut(), &NullProgress).unwrap();

        let index = requested.get_accessor::<i32>("PartitionIndex").unwrap();
        let count = requested.get_accessor::<i32>("PartitionCount").unwrap();
        let parts: Vec<i32> = out.iter().map(|r| index.get(r)).collect();
        assert_eq!(parts, [1, 1, 2]);
        assert!(out.iter().all(|r| count.get(r) == 2));
    }

    #[test]
    fn test_open_interpolated_frame() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(&dir.path().join("cloud_0001.prt"), &[0.0]);
        write_frame(&dir.path().join("cloud_0002.prt"), &[10.0]);
        let sequence = FileSequence::parse(dir.path().join("cloud_0001.prt")).unwrap();

        let mut stream =
            open_frame(&sequence, 1, Some((2, 0.25)), &SequenceOptions::default(), &Schema::empty()).unwrap();
        let out = ParticleArray::from_stream(stream.as_mut(), &NullProgress).unwrap();
        let position = out.schema().get_accessor::<Vec3>("Position").unwrap();
        assert_eq!(position.get(out.get(0).unwrap()), Vec3::new(2.5, 0.0, 0.0));
    }

    #[test_case(LoadPolicy::Strict, true ; "strict")]
    #[test_case(LoadPolicy::Lenient, false ; "lenient")]
    fn test_missing_frame(policy: LoadPolicy, fails: bool) {
        let dir = tempfile::tempdir().unwrap();
        let sequence = FileSequence::parse(dir.path().join("cloud_0001.prt")).unwrap();
        let options = SequenceOptions {
            policy,
            ..SequenceOptions::default()
        };
        let fallback = Schema::new(vec![Channel::of::<Vec3>("Position")]).unwrap();

        match open_frame(&sequence, 9, None, &options, &fallback) {
            Ok(stream) => {
                assert!(!fails);
                assert_eq!(stream.native_schema(), &fallback);
                assert_eq!(stream.count(), Some(0));
            }
            Err(e) => {
                assert!(fails);
                assert!(matches!(e, Error::Source { .. }));
            }
        }
    }
}
