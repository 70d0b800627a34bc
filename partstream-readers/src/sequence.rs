//! Frame-numbered file sequences
//!
//! A sequence is identified by one of its file names. Frame numbers are the
//! trailing digits of the file stem (`cloud_0010.prt`), optionally signed
//! (`cloud_-0005.prt`). A partitioned sequence encodes the partition before
//! the frame number: `cloud_part2of4_0010.prt`.

use std::fs;
use std::path::{Path, PathBuf};

use partstream_core::{Error, Result};
use tracing::trace;

/// Position of one file within a set of partitions, 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Partition {
    /// Index of this partition, `1..=count`
    pub index: u32,

    /// Total number of partitions
    pub count: u32,
}

/// Naming template of a file sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSequence {
    dir: PathBuf,
    head: String,
    partition: Option<Partition>,
    separator: String,
    frame: Option<i64>,
    width: usize,
    extension: String,
}

impl FileSequence {
    /// Derive the naming template from one member of the sequence
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::InvalidArgument(format!("'{}' has no file name", path.display())))?;
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        let (stem, extension) = match file_name.rfind('.') {
            Some(dot) if dot > 0 => file_name.split_at(dot),
            _ => (file_name, ""),
        };

        // Trailing frame digits, with an optional sign
        let digits_start = stem.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        let (mut rest, frame, width) = if digits_start < stem.len() {
            let digits = &stem[digits_start..];
            let mut rest = &stem[..digits_start];
            let mut frame: i64 = digits
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("frame number '{digits}' out of range")))?;
            if let Some(unsigned) = rest.strip_suffix('-') {
                // A dash right after a separator is a sign; "cloud-0010" is not
                if unsigned.ends_with(|c: char| !c.is_alphanumeric()) {
                    frame = -frame;
                    rest = unsigned;
                }
            }
            (rest, Some(frame), digits.len())
        } else {
            (stem, None, 0)
        };

        let mut partition = None;
        let mut separator = String::new();
        if let Some((head, parsed, sep)) = split_partition(rest) {
            partition = Some(parsed);
            separator = sep.to_string();
            rest = head;
        }

        Ok(Self {
            dir,
            head: rest.to_string(),
            partition,
            separator,
            frame,
            width,
            extension: extension.to_string(),
        })
    }

    /// Check if the name carries a frame number
    pub fn is_sequence(&self) -> bool {
        self.frame.is_some()
    }

    /// Frame number of the file the template was parsed from
    pub fn frame(&self) -> Option<i64> {
        self.frame
    }

    /// Partition of the file the template was parsed from
    pub fn partition(&self) -> Option<Partition> {
        self.partition
    }

    /// Directory holding the sequence
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of `frame`, for the template's own partition
    pub fn path_for_frame(&self, frame: i64) -> PathBuf {
        self.path_for(frame, self.partition.map(|p| p.index))
    }

    /// Path of `frame` in partition `index`.
    ///
    /// Non-sequence templates always map to their single file.
    pub fn path_for(&self, frame: i64, index: Option<u32>) -> PathBuf {
        let mut name = self.head.clone();
        if let (Some(partition), Some(index)) = (self.partition, index) {
            name.push_str(&format!("part{index}of{}", partition.count));
            name.push_str(&self.separator);
        }

        let frame = if self.is_sequence() { Some(frame) } else { self.frame };
        if let Some(frame) = frame {
            if frame < 0 {
                name.push('-');
            }
            name.push_str(&format!("{:0width$}", frame.unsigned_abs(), width = self.width));
        }
        name.push_str(&self.extension);
        self.dir.join(name)
    }

    /// Paths of every partition of `frame`, existing or not
    pub fn partition_paths(&self, frame: i64) -> Vec<(Option<Partition>, PathBuf)> {
        match self.partition {
            Some(partition) => (1..=partition.count)
                .map(|index| {
                    let part = Partition {
                        index,
                        count: partition.count,
                    };
                    (Some(part), self.path_for(frame, Some(index)))
                })
                .collect(),
            None => vec![(None, self.path_for(frame, None))],
        }
    }

    /// Partitions of `frame` that exist on disk
    pub fn existing_partitions(&self, frame: i64) -> Vec<(Option<Partition>, PathBuf)> {
        self.partition_paths(frame)
            .into_iter()
            .filter(|(_, path)| path.is_file())
            .collect()
    }

    /// Check if any file of `frame` exists
    pub fn frame_exists(&self, frame: i64) -> bool {
        !self.existing_partitions(frame).is_empty()
    }

    /// Sorted, deduplicated frame numbers present in the directory
    pub fn available_frames(&self) -> Result<Vec<i64>> {
        if !self.is_sequence() {
            return Ok(Vec::new());
        }
        let dir = if self.dir.as_os_str().is_empty() { Path::new(".") } else { &self.dir };

        let mut frames = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Ok(other) = FileSequence::parse(&path) else {
                continue;
            };
            if self.same_template(&other) {
                if let Some(frame) = other.frame {
                    frames.push(frame);
                }
            }
        }
        frames.sort_unstable();
        frames.dedup();
        trace!(dir = %dir.display(), frames = frames.len(), "scanned sequence directory");
        Ok(frames)
    }

    fn same_template(&self, other: &FileSequence) -> bool {
        self.head == other.head
            && self.separator == other.separator
            && self.extension.eq_ignore_ascii_case(&other.extension)
            && self.partition.map(|p| p.count) == other.partition.map(|p| p.count)
            && other.is_sequence()
    }
}

/// Split `head`, `partXofY` and the separator that follows it
fn split_partition(stem: &str) -> Option<(&str, Partition, &str)> {
    let separator_start = stem.trim_end_matches(|c: char| !c.is_alphanumeric()).len();
    let (body, separator) = stem.split_at(separator_start);

    let start = body.rfind("part")?;
    let (index, count) = body[start + 4..].split_once("of")?;
    if index.is_empty() || count.is_empty() || !index.bytes().chain(count.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let partition = Partition {
        index: index.parse().ok()?,
        count: count.parse().ok()?,
    };
    if partition.index == 0 || partition.index > partition.count {
        return None;
    }
    Some((&body[..start], partition, separator))
}
