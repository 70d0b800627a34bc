//! Typed views into raw particle records

use std::marker::PhantomData;

use glam::{Vec2, Vec3, Vec4};
use half::f16;
use static_assertions::const_assert_eq;

use crate::schema::{DataType, MAX_ARITY};

const_assert_eq!(std::mem::size_of::<Vec3>(), 12);
const_assert_eq!(std::mem::size_of::<Vec4>(), 16);

/// A Rust value type that maps onto a channel's element type and arity
pub trait ChannelValue: Copy + Send + Sync + 'static {
    /// Element type of the channel
    const DATA_TYPE: DataType;

    /// Number of elements
    const ARITY: usize;

    /// Byte size of one value
    const SIZE: usize = Self::ARITY * Self::DATA_TYPE.size_bytes();

    /// Read a value from exactly `SIZE` bytes in native order
    fn read(bytes: &[u8]) -> Self;

    /// Write a value into exactly `SIZE` bytes in native order
    fn write(self, bytes: &mut [u8]);

    /// Build a value from `ARITY` widened elements
    fn from_elements(elements: &[f64]) -> Self;

    /// Widen each element into `out[..ARITY]`
    fn to_elements(self, out: &mut [f64]);
}

/// A single-element channel value
pub trait ScalarValue: ChannelValue + bytemuck::Pod {}

macro_rules! impl_scalar {
    ($t:ty, $data_type:expr, $from:expr, $to:expr) => {
        impl ChannelValue for $t {
            const DATA_TYPE: DataType = $data_type;
            const ARITY: usize = 1;

            #[inline]
            fn read(bytes: &[u8]) -> Self {
                bytemuck::pod_read_unaligned(&bytes[..Self::SIZE])
            }

            #[inline]
            fn write(self, bytes: &mut [u8]) {
                bytes[..Self::SIZE].copy_from_slice(bytemuck::bytes_of(&self));
            }

            #[inline]
            fn from_elements(elements: &[f64]) -> Self {
                let from: fn(f64) -> $t = $from;
                from(elements[0])
            }

            #[inline]
            fn to_elements(self, out: &mut [f64]) {
                let to: fn($t) -> f64 = $to;
                out[0] = to(self);
            }
        }

        impl ScalarValue for $t {}
    };
}

impl_scalar!(i8, DataType::Int8, |v| v as i8, f64::from);
impl_scalar!(i16, DataType::Int16, |v| v as i16, f64::from);
impl_scalar!(i32, DataType::Int32, |v| v as i32, f64::from);
impl_scalar!(i64, DataType::Int64, |v| v as i64, |v| v as f64);
impl_scalar!(u8, DataType::UInt8, |v| v as u8, f64::from);
impl_scalar!(u16, DataType::UInt16, |v| v as u16, f64::from);
impl_scalar!(u32, DataType::UInt32, |v| v as u32, f64::from);
impl_scalar!(u64, DataType::UInt64, |v| v as u64, |v| v as f64);
impl_scalar!(f16, DataType::Float16, f16::from_f64, f16::to_f64);
impl_scalar!(f32, DataType::Float32, |v| v as f32, f64::from);
impl_scalar!(f64, DataType::Float64, |v| v, |v| v);

impl<T: ScalarValue, const N: usize> ChannelValue for [T; N] {
    const DATA_TYPE: DataType = T::DATA_TYPE;
    const ARITY: usize = N;

    #[inline]
    fn read(bytes: &[u8]) -> Self {
        std::array::from_fn(|i| T::read(&bytes[i * T::SIZE..]))
    }

    #[inline]
    fn write(self, bytes: &mut [u8]) {
        for (i, value) in self.into_iter().enumerate() {
            value.write(&mut bytes[i * T::SIZE..]);
        }
    }

    fn from_elements(elements: &[f64]) -> Self {
        std::array::from_fn(|i| T::from_elements(&elements[i..=i]))
    }

    fn to_elements(self, out: &mut [f64]) {
        for (i, value) in self.into_iter().enumerate() {
            value.to_elements(&mut out[i..=i]);
        }
    }
}

macro_rules! impl_glam {
    ($t:ty, $n:expr) => {
        impl ChannelValue for $t {
            const DATA_TYPE: DataType = DataType::Float32;
            const ARITY: usize = $n;

            #[inline]
            fn read(bytes: &[u8]) -> Self {
                <$t>::from_array(<[f32; $n]>::read(bytes))
            }

            #[inline]
            fn write(self, bytes: &mut [u8]) {
                self.to_array().write(bytes);
            }

            fn from_elements(elements: &[f64]) -> Self {
                <$t>::from_array(<[f32; $n]>::from_elements(elements))
            }

            fn to_elements(self, out: &mut [f64]) {
                self.to_array().to_elements(out);
            }
        }
    };
}

impl_glam!(Vec2, 2);
impl_glam!(Vec3, 3);
impl_glam!(Vec4, 4);

/// Typed getter/setter bound to one channel of one schema layout.
///
/// An accessor is only valid for records of the layout it was obtained from.
/// Using it on a record of any other size is a programming error and panics.
#[derive(Debug)]
pub struct Accessor<T> {
    offset: usize,
    record_size: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Accessor<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Accessor<T> {}

impl<T: ChannelValue> Accessor<T> {
    pub(crate) fn new(offset: usize, record_size: usize) -> Self {
        Self {
            offset,
            record_size,
            _marker: PhantomData,
        }
    }

    /// Byte offset of the channel within a record
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Read the channel value from a record
    #[inline]
    pub fn get(&self, record: &[u8]) -> T {
        check_layout(record.len(), self.record_size);
        T::read(&record[self.offset..self.offset + T::SIZE])
    }

    /// Write the channel value into a record
    #[inline]
    pub fn set(&self, record: &mut [u8], value: T) {
        check_layout(record.len(), self.record_size);
        value.write(&mut record[self.offset..self.offset + T::SIZE]);
    }
}

#[derive(Debug, Clone, Copy)]
enum Binding<T> {
    Channel { offset: usize, data_type: DataType },
    Constant(T),
}

/// Accessor that converts from whatever element type the channel stores.
///
/// When bound to a default value instead of a channel every read returns the
/// default and writes are dropped.
#[derive(Debug, Clone, Copy)]
pub struct ConvertingAccessor<T> {
    binding: Binding<T>,
    record_size: usize,
}

impl<T: ChannelValue> ConvertingAccessor<T> {
    pub(crate) fn bound(offset: usize, data_type: DataType, record_size: usize) -> Self {
        Self {
            binding: Binding::Channel { offset, data_type },
            record_size,
        }
    }

    pub(crate) fn constant(value: T, record_size: usize) -> Self {
        Self {
            binding: Binding::Constant(value),
            record_size,
        }
    }

    /// Check if reads come from the default value rather than a channel
    pub fn is_constant(&self) -> bool {
        matches!(self.binding, Binding::Constant(_))
    }

    /// Read the channel value from a record, converting as needed
    #[inline]
    pub fn get(&self, record: &[u8]) -> T {
        match self.binding {
            Binding::Constant(value) => value,
            Binding::Channel { offset, data_type } => {
                check_layout(record.len(), self.record_size);
                if data_type == T::DATA_TYPE {
                    return T::read(&record[offset..offset + T::SIZE]);
                }
                let size = data_type.size_bytes();
                let mut elements = [0.0f64; MAX_ARITY];
                for (i, element) in elements.iter_mut().take(T::ARITY).enumerate() {
                    *element = data_type.read_f64(&record[offset + i * size..]);
                }
                T::from_elements(&elements[..T::ARITY])
            }
        }
    }

    /// Write a value into a record, converting as needed
    #[inline]
    pub fn set(&self, record: &mut [u8], value: T) {
        let Binding::Channel { offset, data_type } = self.binding else {
            return;
        };
        check_layout(record.len(), self.record_size);
        if data_type == T::DATA_TYPE {
            value.write(&mut record[offset..offset + T::SIZE]);
            return;
        }
        let size = data_type.size_bytes();
        let mut elements = [0.0f64; MAX_ARITY];
        value.to_elements(&mut elements[..T::ARITY]);
        for (i, element) in elements.iter().take(T::ARITY).enumerate() {
            data_type.write_f64(&mut record[offset + i * size..], *element);
        }
    }
}

#[inline]
fn check_layout(actual: usize, expected: usize) {
    assert_eq!(
        actual, expected,
        "accessor used on a record of a different layout; rebind after the schema changes"
    );
}
