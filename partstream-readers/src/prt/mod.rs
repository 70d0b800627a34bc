//! Self-describing binary particle files
//!
//! A file holds one finalized schema, an optional record count, metadata and
//! a payload of packed little-endian records, optionally compressed.

mod header;
mod reader;
mod writer;

pub use header::{Compression, FileHeader, FileMetadata, MAGIC, VERSION};
pub use reader::{open_stream, LoadPolicy, PrtFileStream, PrtReaderOptions};
pub use writer::{write_stream, PrtWriter, PrtWriterOptions};

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use partstream_core::{
        Channel, DataType, Error, ErrorKind, NullProgress, ParticleArray, ParticleStream, Schema,
    };
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;
    use test_case::test_case;

    fn schema() -> Schema {
        Schema::new(vec![
            Channel::of::<Vec3>("Position"),
            Channel::of::<f32>("Density"),
            Channel::of::<i64>("ID"),
        ])
        .unwrap()
    }

    fn record(schema: &Schema, i: usize) -> Vec<u8> {
        let mut record = schema.default_record();
        schema.get_accessor::<Vec3>("Position").unwrap().set(&mut record, Vec3::new(i as f32, 0.0, 1.0));
        schema.get_accessor::<f32>("Density").unwrap().set(&mut record, 0.5 * i as f32);
        schema.get_accessor::<i64>("ID").unwrap().set(&mut record, 100 + i as i64);
        record
    }

    fn options(compression: Compression) -> PrtWriterOptions {
        PrtWriterOptions {
            compression,
            ..Default::default()
        }
    }

    #[test_case(Compression::None, Some(10) ; "raw with count")]
    #[test_case(Compression::None, None ; "raw deferred")]
    #[test_case(Compression::Lz4, Some(10) ; "lz4 with count")]
    #[test_case(Compression::Lz4, None ; "lz4 deferred")]
    fn test_written_file_reads_back(compression: Compression, declared: Option<u64>) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cloud_0001.prt");
        let schema = schema();

        let mut writer = PrtWriter::create(&path, &schema, declared, options(compression)).unwrap();
        for i in 0..10 {
            writer.write_record(&record(&schema, i)).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 10);

        let mut stream = PrtFileStream::open(&path, PrtReaderOptions::default()).unwrap();
        assert_eq!(stream.native_schema(), &schema);
        assert_eq!(stream.count(), Some(10));
        assert_eq!(stream.compression(), compression);

        let array = ParticleArray::from_stream(&mut stream, &NullProgress).unwrap();
        assert_eq!(array.len(), 10);
        for (i, stored) in array.iter().enumerate() {
            assert_eq!(stored, record(&schema, i).as_slice());
        }
    }

    #[test]
    fn test_metadata_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.prt");
        let mut options = options(Compression::None);
        options.metadata.frame_rate = Some(24.0);
        options.metadata.length_unit = Some("meters".to_string());
        options.metadata.properties.insert("author".to_string(), "sim".to_string());

        let mut writer = PrtWriter::create(&path, &schema(), Some(0), options.clone()).unwrap();
        writer.finish().unwrap();

        let stream = PrtFileStream::open(&path, PrtReaderOptions::default()).unwrap();
        assert_eq!(stream.metadata(), &options.metadata);
    }

    #[test]
    fn test_reads_into_requested_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("adapt.prt");
        let schema = schema();
        let mut writer = PrtWriter::create(&path, &schema, Some(3), options(Compression::Lz4)).unwrap();
        for i in 0..3 {
            writer.write_record(&record(&schema, i)).unwrap();
        }
        writer.finish().unwrap();

        let requested = Schema::new(vec![
            Channel::new("Density", 1, DataType::Float64),
            Channel::of::<Vec3>("Color"),
        ])
        .unwrap();
        let mut stream = PrtFileStream::open(&path, PrtReaderOptions::default()).unwrap();
        stream.set_schema(&requested).unwrap();

        let density = requested.get_accessor::<f64>("Density").unwrap();
        let color = requested.get_accessor::<Vec3>("Color").unwrap();
        let array = ParticleArray::from_stream(&mut stream, &NullProgress).unwrap();
        assert_eq!(density.get(array.get(2).unwrap()), 1.0);
        assert_eq!(color.get(array.get(2).unwrap()), Vec3::ZERO);
    }

    #[test]
    fn test_declared_count_mismatch_is_consistency_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.prt");
        let schema = schema();
        let mut writer = PrtWriter::create(&path, &schema, Some(5), options(Compression::None)).unwrap();
        writer.write_record(&record(&schema, 0)).unwrap();

        let err = writer.finish().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
    }

    #[test]
    fn test_write_stream_copies_everything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("copy.prt");
        let schema = schema();
        let mut array = ParticleArray::new(schema.clone());
        for i in 0..7 {
            array.push(&record(&schema, i)).unwrap();
        }
        let mut source = crate::ArrayStream::from_array(array);
        let written = write_stream(&path, &mut source, &NullProgress, PrtWriterOptions::default()).unwrap();
        assert_eq!(written, 7);

        let stream = PrtFileStream::open(&path, PrtReaderOptions::default()).unwrap();
        assert_eq!(stream.count(), Some(7));
    }

    fn truncated_file(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("truncated.prt");
        let schema = schema();
        let mut writer = PrtWriter::create(&path, &schema, Some(4), options(Compression::None)).unwrap();
        for i in 0..4 {
            writer.write_record(&record(&schema, i)).unwrap();
        }
        writer.finish().unwrap();

        // Drop the last record and a half
        let len = std::fs::metadata(&path).unwrap().len();
        let cut = (schema.record_size() + schema.record_size() / 2) as u64;
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - cut).unwrap();
        path
    }

    #[test]
    fn test_strict_truncation_is_source_error() {
        let dir = tempdir().unwrap();
        let path = truncated_file(dir.path());
        let mut stream = PrtFileStream::open(&path, PrtReaderOptions::default()).unwrap();

        let err = ParticleArray::from_stream(&mut stream, &NullProgress).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Source);
    }

    #[test]
    fn test_lenient_truncation_ends_early() {
        let dir = tempdir().unwrap();
        let path = truncated_file(dir.path());
        let options = PrtReaderOptions {
            policy: LoadPolicy::Lenient,
            ..Default::default()
        };
        let mut stream = PrtFileStream::open(&path, options).unwrap();

        let array = ParticleArray::from_stream(&mut stream, &NullProgress).unwrap();
        assert_eq!(array.len(), 2);
    }

    #[test]
    fn test_missing_file_policies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.prt");

        let err = open_stream(&path, PrtReaderOptions::default()).err().unwrap();
        assert!(matches!(err, Error::Source { .. }));

        let lenient = PrtReaderOptions {
            policy: LoadPolicy::Lenient,
            ..Default::default()
        };
        let stream = open_stream(&path, lenient).unwrap();
        assert_eq!(stream.count(), Some(0));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foreign.prt");
        std::fs::File::create(&path).unwrap().write_all(b"ply\nformat ascii 1.0\n").unwrap();

        let err = PrtFileStream::open(&path, PrtReaderOptions::default()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Source);
    }
}
