//! Record conversion between two schema layouts

use crate::error::{Error, Result};
use crate::schema::{DataType, Schema};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyOp {
    /// Raw byte copy of one or more adjacent channels
    Copy { src: usize, dest: usize, len: usize },

    /// Element-wise numeric conversion of one channel
    Convert {
        src: usize,
        src_type: DataType,
        dest: usize,
        dest_type: DataType,
        arity: usize,
    },
}

/// Copies the channels two schemas have in common from a source record into a
/// destination record.
///
/// Destination channels with no counterpart in the source are left untouched,
/// so callers normally pre-fill the destination with a default record.
#[derive(Debug, Clone)]
pub struct SchemaAdaptor {
    ops: Vec<CopyOp>,
    src_size: usize,
    dest_size: usize,
    identity: bool,
}

impl SchemaAdaptor {
    /// Build an adaptor writing `dest` records from `src` records.
    ///
    /// Fails with `TypeMismatch` when a common channel differs in arity.
    pub fn new(dest: &Schema, src: &Schema) -> Result<Self> {
        let mut ops: Vec<CopyOp> = Vec::new();

        for dest_channel in dest.channels() {
            let Some(src_channel) = src.channel(dest_channel.name()) else {
                continue;
            };
            if src_channel.arity() != dest_channel.arity() {
                return Err(Error::TypeMismatch {
                    channel: dest_channel.name().to_string(),
                    expected: format!("{}[{}]", dest_channel.data_type(), dest_channel.arity()),
                    found: format!("{}[{}]", src_channel.data_type(), src_channel.arity()),
                });
            }

            let op = if src_channel.data_type() == dest_channel.data_type() {
                CopyOp::Copy {
                    src: src_channel.offset(),
                    dest: dest_channel.offset(),
                    len: dest_channel.size_bytes(),
                }
            } else {
                CopyOp::Convert {
                    src: src_channel.offset(),
                    src_type: src_channel.data_type(),
                    dest: dest_channel.offset(),
                    dest_type: dest_channel.data_type(),
                    arity: dest_channel.arity(),
                }
            };

            // Merge with the previous copy when both sides are contiguous
            if let (Some(CopyOp::Copy { src, dest, len }), CopyOp::Copy { src: s, dest: d, len: l }) =
                (ops.last_mut(), op)
            {
                if *src + *len == s && *dest + *len == d {
                    *len += l;
                    continue;
                }
            }
            ops.push(op);
        }

        Ok(Self {
            ops,
            src_size: src.record_size(),
            dest_size: dest.record_size(),
            identity: dest == src,
        })
    }

    /// Adaptor from a layout to itself
    pub fn identity(schema: &Schema) -> Self {
        let size = schema.record_size();
        Self {
            ops: vec![CopyOp::Copy { src: 0, dest: 0, len: size }],
            src_size: size,
            dest_size: size,
            identity: true,
        }
    }

    /// Check if both layouts are identical, making a copy a plain memcpy
    pub fn is_identity(&self) -> bool {
        self.identity
    }

    /// Size of a source record
    pub fn src_size(&self) -> usize {
        self.src_size
    }

    /// Size of a destination record
    pub fn dest_size(&self) -> usize {
        self.dest_size
    }

    /// Convert one record
    #[inline]
    pub fn copy(&self, dest: &mut [u8], src: &[u8]) {
        debug_assert_eq!(dest.len(), self.dest_size);
        debug_assert_eq!(src.len(), self.src_size);

        if self.identity {
            dest.copy_from_slice(src);
            return;
        }

        for op in &self.ops {
            match *op {
                CopyOp::Copy { src: s, dest: d, len } => {
                    dest[d..d + len].copy_from_slice(&src[s..s + len]);
                }
                CopyOp::Convert {
                    src: s,
                    src_type,
                    dest: d,
                    dest_type,
                    arity,
                } => {
                    let src_step = src_type.size_bytes();
                    let dest_step = dest_type.size_bytes();
                    for i in 0..arity {
                        let value = src_type.read_f64(&src[s + i * src_step..]);
                        dest_type.write_f64(&mut dest[d + i * dest_step..], value);
                    }
                }
            }
        }
    }

    /// Convert `count` contiguous records.
    ///
    /// Each destination record is first filled from `default` when given.
    pub fn copy_batch(&self, dest: &mut [u8], src: &[u8], count: usize, default: Option<&[u8]>) {
        if self.identity {
            let len = count * self.src_size;
            dest[..len].copy_from_slice(&src[..len]);
            return;
        }
        let (ds, ss) = (self.dest_size, self.src_size);
        for i in 0..count {
            let dest_record = &mut dest[i * ds..(i + 1) * ds];
            if let Some(default) = default {
                dest_record.copy_from_slice(default);
            }
            self.copy(dest_record, &src[i * ss..(i + 1) * ss]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Channel;
    use glam::Vec3;
    use proptest::prelude::*;

    fn source_schema() -> Schema {
        Schema::new(vec![
            Channel::of::<Vec3>("Position"),
            Channel::of::<Vec3>("Velocity"),
            Channel::of::<f32>("Density"),
            Channel::of::<u64>("ID"),
        ])
        .unwrap()
    }

    #[test]
    fn test_adjacent_copies_are_merged() {
        let dest = Schema::new(vec![Channel::of::<Vec3>("Position"), Channel::of::<Vec3>("Velocity")]).unwrap();
        let adaptor = SchemaAdaptor::new(&dest, &source_schema()).unwrap();
        assert_eq!(adaptor.ops, vec![CopyOp::Copy { src: 0, dest: 0, len: 24 }]);
        assert!(!adaptor.is_identity());
    }

    #[test]
    fn test_missing_channels_left_untouched() {
        let src = source_schema();
        let dest = Schema::new(vec![Channel::of::<f32>("Density"), Channel::of::<Vec3>("Color")]).unwrap();
        let adaptor = SchemaAdaptor::new(&dest, &src).unwrap();

        let mut src_record = src.default_record();
        src.get_accessor::<f32>("Density").unwrap().set(&mut src_record, 2.5);

        let color = dest.get_accessor::<Vec3>("Color").unwrap();
        let mut dest_record = dest.default_record();
        color.set(&mut dest_record, Vec3::ONE);
        adaptor.copy(&mut dest_record, &src_record);

        assert_eq!(dest.get_accessor::<f32>("Density").unwrap().get(&dest_record), 2.5);
        assert_eq!(color.get(&dest_record), Vec3::ONE);
    }

    #[test]
    fn test_type_conversion() {
        let src = source_schema();
        let dest = Schema::new(vec![
            Channel::new("Density", 1, DataType::Float64),
            Channel::new("ID", 1, DataType::Int32),
        ])
        .unwrap();
        let adaptor = SchemaAdaptor::new(&dest, &src).unwrap();

        let mut src_record = src.default_record();
        src.get_accessor::<f32>("Density").unwrap().set(&mut src_record, 0.75);
        src.get_accessor::<u64>("ID").unwrap().set(&mut src_record, 9001);

        let mut dest_record = dest.default_record();
        adaptor.copy(&mut dest_record, &src_record);
        assert_eq!(dest.get_accessor::<f64>("Density").unwrap().get(&dest_record), 0.75);
        assert_eq!(dest.get_accessor::<i32>("ID").unwrap().get(&dest_record), 9001);
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let dest = Schema::new(vec![Channel::new("Density", 3, DataType::Float32)]).unwrap();
        assert!(matches!(
            SchemaAdaptor::new(&dest, &source_schema()),
            Err(Error::TypeMismatch { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_round_trip_preserves_common_channels(
            position in prop::array::uniform3(-1.0e6f32..1.0e6),
            density in any::<f32>(),
            id in any::<u64>(),
        ) {
            let s1 = source_schema();
            let s2 = Schema::new(vec![
                Channel::of::<u64>("ID"),
                Channel::of::<Vec3>("Color"),
                Channel::of::<Vec3>("Position"),
                Channel::of::<f32>("Density"),
            ]).unwrap();

            let mut original = s1.default_record();
            s1.get_accessor::<[f32; 3]>("Position").unwrap().set(&mut original, position);
            s1.get_accessor::<f32>("Density").unwrap().set(&mut original, density);
            s1.get_accessor::<u64>("ID").unwrap().set(&mut original, id);

            let forward = SchemaAdaptor::new(&s2, &s1).unwrap();
            let back = SchemaAdaptor::new(&s1, &s2).unwrap();

            let mut middle = s2.default_record();
            forward.copy(&mut middle, &original);
            let mut restored = s1.default_record();
            back.copy(&mut restored, &middle);

            for name in ["Position", "Density", "ID"] {
                let channel = s1.channel(name).unwrap();
                let range = channel.offset()..channel.offset() + channel.size_bytes();
                prop_assert_eq!(&restored[range.clone()], &original[range]);
            }
        }
    }
}
