//! Channel schema definition for particle records

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::accessor::{Accessor, ChannelValue, ConvertingAccessor};
use crate::error::{Error, Result};

/// Largest number of elements a single channel may hold
pub const MAX_ARITY: usize = 16;

/// Element type of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 8-bit signed integer
    Int8,

    /// 16-bit signed integer
    Int16,

    /// 32-bit signed integer
    Int32,

    /// 64-bit signed integer
    Int64,

    /// 8-bit unsigned integer
    UInt8,

    /// 16-bit unsigned integer
    UInt16,

    /// 32-bit unsigned integer
    UInt32,

    /// 64-bit unsigned integer
    UInt64,

    /// 16-bit floating point
    Float16,

    /// 32-bit floating point
    Float32,

    /// 64-bit floating point
    Float64,
}

impl DataType {
    /// Every supported element type
    pub const ALL: [DataType; 11] = [
        DataType::Int8,
        DataType::Int16,
        DataType::Int32,
        DataType::Int64,
        DataType::UInt8,
        DataType::UInt16,
        DataType::UInt32,
        DataType::UInt64,
        DataType::Float16,
        DataType::Float32,
        DataType::Float64,
    ];

    /// Get the size of this type in bytes
    pub const fn size_bytes(self) -> usize {
        match self {
            DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 | DataType::Float16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
        }
    }

    /// Check if this type is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float16 | DataType::Float32 | DataType::Float64)
    }

    /// Stable numeric code used by the on-disk format
    pub fn code(self) -> u32 {
        match self {
            DataType::Int8 => 0,
            DataType::Int16 => 1,
            DataType::Int32 => 2,
            DataType::Int64 => 3,
            DataType::UInt8 => 4,
            DataType::UInt16 => 5,
            DataType::UInt32 => 6,
            DataType::UInt64 => 7,
            DataType::Float16 => 8,
            DataType::Float32 => 9,
            DataType::Float64 => 10,
        }
    }

    /// Inverse of [`DataType::code`]
    pub fn from_code(code: u32) -> Option<Self> {
        DataType::ALL.iter().copied().find(|t| t.code() == code)
    }

    /// Lowercase name, as used in settings (`"float32"`, `"int64"`, ...)
    pub fn name(self) -> &'static str {
        match self {
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Float16 => "float16",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        }
    }

    /// Parse a type name, ignoring case
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        DataType::ALL.iter().copied().find(|t| t.name() == lower)
    }

    /// Read one element stored in native byte order and widen it to `f64`
    pub fn read_f64(self, bytes: &[u8]) -> f64 {
        match self {
            DataType::Int8 => f64::from(i8::from_ne_bytes(array(bytes))),
            DataType::Int16 => f64::from(i16::from_ne_bytes(array(bytes))),
            DataType::Int32 => f64::from(i32::from_ne_bytes(array(bytes))),
            DataType::Int64 => i64::from_ne_bytes(array(bytes)) as f64,
            DataType::UInt8 => f64::from(bytes[0]),
            DataType::UInt16 => f64::from(u16::from_ne_bytes(array(bytes))),
            DataType::UInt32 => f64::from(u32::from_ne_bytes(array(bytes))),
            DataType::UInt64 => u64::from_ne_bytes(array(bytes)) as f64,
            DataType::Float16 => half::f16::from_bits(u16::from_ne_bytes(array(bytes))).to_f64(),
            DataType::Float32 => f64::from(f32::from_ne_bytes(array(bytes))),
            DataType::Float64 => f64::from_ne_bytes(array(bytes)),
        }
    }

    /// Narrow `value` to this type and store it in native byte order.
    ///
    /// Float to integer conversion truncates toward zero and saturates.
    pub fn write_f64(self, bytes: &mut [u8], value: f64) {
        let size = self.size_bytes();
        let dest = &mut bytes[..size];
        match self {
            DataType::Int8 => dest.copy_from_slice(&(value as i8).to_ne_bytes()),
            DataType::Int16 => dest.copy_from_slice(&(value as i16).to_ne_bytes()),
            DataType::Int32 => dest.copy_from_slice(&(value as i32).to_ne_bytes()),
            DataType::Int64 => dest.copy_from_slice(&(value as i64).to_ne_bytes()),
            DataType::UInt8 => dest.copy_from_slice(&(value as u8).to_ne_bytes()),
            DataType::UInt16 => dest.copy_from_slice(&(value as u16).to_ne_bytes()),
            DataType::UInt32 => dest.copy_from_slice(&(value as u32).to_ne_bytes()),
            DataType::UInt64 => dest.copy_from_slice(&(value as u64).to_ne_bytes()),
            DataType::Float16 => {
                dest.copy_from_slice(&half::f16::from_f64(value).to_bits().to_ne_bytes());
            }
            DataType::Float32 => dest.copy_from_slice(&(value as f32).to_ne_bytes()),
            DataType::Float64 => dest.copy_from_slice(&value.to_ne_bytes()),
        }
    }
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A named, typed attribute of every record in a schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    /// Name of the channel
    name: String,

    /// Number of elements per record
    arity: usize,

    /// Element type
    data_type: DataType,

    /// Byte offset inside a record, assigned by the owning schema
    #[serde(skip)]
    offset: usize,
}

impl Channel {
    /// Create a new channel description
    pub fn new(name: impl Into<String>, arity: usize, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            arity,
            data_type,
            offset: 0,
        }
    }

    /// Create a channel whose type and arity match a Rust value type
    pub fn of<T: ChannelValue>(name: impl Into<String>) -> Self {
        Self::new(name, T::ARITY, T::DATA_TYPE)
    }

    /// Get the name of this channel
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of elements per record
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Get the element type
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Byte offset of this channel within a record
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of this channel within a record
    pub fn size_bytes(&self) -> usize {
        self.arity * self.data_type.size_bytes()
    }

    /// Check if both channels hold the same element type and arity
    pub fn same_type(&self, other: &Channel) -> bool {
        self.arity == other.arity && self.data_type == other.data_type
    }

    fn type_description(&self) -> String {
        format!("{}[{}]", self.data_type, self.arity)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}[{}] @{}", self.name, self.data_type, self.arity, self.offset)
    }
}

/// Ordered set of channels with packed byte offsets.
///
/// A schema is built with [`Schema::define_channel`] and frozen with
/// [`Schema::end_definition`]. Equality is structural: two schemas are equal
/// when they hold the same channels at the same offsets.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    /// Channels in definition order
    channels: Vec<Channel>,

    /// Channel indices by name for faster lookup
    indices: HashMap<String, usize>,

    /// Size of one record in bytes
    record_size: usize,

    /// Whether definition has ended
    finalized: bool,
}

impl Schema {
    /// Create a finalized schema from the given channels, packed in order
    pub fn new(channels: Vec<Channel>) -> Result<Self> {
        let mut schema = Self::default();
        for channel in channels {
            schema.define_channel(&channel.name, channel.arity, channel.data_type)?;
        }
        schema.end_definition();
        Ok(schema)
    }

    /// Create a finalized schema with no channels
    pub fn empty() -> Self {
        Self {
            finalized: true,
            ..Self::default()
        }
    }

    /// Add a channel at the end of the layout.
    ///
    /// Fails once the schema is finalized; use [`Schema::append_channel`] to
    /// grow a finalized layout.
    pub fn define_channel(&mut self, name: &str, arity: usize, data_type: DataType) -> Result<()> {
        if self.finalized {
            return Err(Error::SchemaFinalized);
        }
        self.push_channel(Channel::new(name, arity, data_type))
    }

    /// Typed variant of [`Schema::define_channel`]
    pub fn define<T: ChannelValue>(&mut self, name: &str) -> Result<()> {
        self.define_channel(name, T::ARITY, T::DATA_TYPE)
    }

    /// Freeze the layout
    pub fn end_definition(&mut self) {
        self.finalized = true;
    }

    /// Check if definition has ended
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Append a channel, producing a grown layout.
    ///
    /// Offsets of existing channels are unchanged, but the record size is not,
    /// so accessors bound to this schema must be rebound.
    pub fn append_channel(&mut self, channel: Channel) -> Result<()> {
        self.push_channel(channel)
    }

    fn push_channel(&mut self, channel: Channel) -> Result<()> {
        if channel.arity == 0 || channel.arity > MAX_ARITY {
            return Err(Error::InvalidArgument(format!(
                "channel '{}' has arity {}, expected 1..={}",
                channel.name, channel.arity, MAX_ARITY
            )));
        }
        if channel.name.is_empty() {
            return Err(Error::InvalidArgument("channel name is empty".to_string()));
        }
        if self.indices.contains_key(&channel.name) {
            return Err(Error::DuplicateChannel(channel.name));
        }
        self.place(channel);
        Ok(())
    }

    /// Append a channel already validated by another layout, whose name is
    /// not yet taken here
    fn place(&mut self, mut channel: Channel) {
        channel.offset = self.record_size;
        self.record_size += channel.size_bytes();
        self.indices.insert(channel.name.clone(), self.channels.len());
        self.channels.push(channel);
    }

    /// Check if a channel with this name exists
    pub fn has_channel(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    /// Get a channel by name
    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.indices.get(name).map(|&i| &self.channels[i])
    }

    /// Get all channels in layout order
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Get the number of channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Check if this schema has no channels
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Size of one record in bytes
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Check if every channel of `other` is present here with the same type
    pub fn contains_all(&self, other: &Schema) -> bool {
        other
            .channels
            .iter()
            .all(|c| self.channel(&c.name).is_some_and(|own| own.same_type(c)))
    }

    /// Union with `other`: this layout is kept as a prefix and channels only
    /// present in `other` are appended in `other`'s order.
    ///
    /// When a channel appears in both, this schema's type wins.
    pub fn union(&self, other: &Schema) -> Schema {
        let mut result = self.clone();
        for channel in &other.channels {
            if !result.has_channel(&channel.name) {
                result.place(channel.clone());
            }
        }
        result.finalized = true;
        result
    }

    /// A repacked schema with the named channels removed
    pub fn without(&self, names: &[&str]) -> Schema {
        self.filtered(|c| !names.contains(&c.name()))
    }

    /// A repacked schema keeping only channels also present in `other`
    pub fn intersection(&self, other: &Schema) -> Schema {
        self.filtered(|c| other.has_channel(c.name()))
    }

    fn filtered(&self, mut keep: impl FnMut(&Channel) -> bool) -> Schema {
        let mut result = Schema::default();
        for channel in self.channels.iter().filter(|c| keep(c)) {
            result.place(channel.clone());
        }
        result.finalized = true;
        result
    }

    /// A zero-filled record in this layout
    pub fn default_record(&self) -> Vec<u8> {
        vec![0u8; self.record_size]
    }

    /// Get a typed accessor for a channel.
    ///
    /// Fails with `ChannelMissing` if the channel is absent and `TypeMismatch`
    /// if its element type or arity differ from `T`.
    pub fn get_accessor<T: ChannelValue>(&self, name: &str) -> Result<Accessor<T>> {
        let channel = self
            .channel(name)
            .ok_or_else(|| Error::ChannelMissing(name.to_string()))?;
        if channel.data_type != T::DATA_TYPE || channel.arity != T::ARITY {
            return Err(Error::TypeMismatch {
                channel: name.to_string(),
                expected: format!("{}[{}]", T::DATA_TYPE, T::ARITY),
                found: channel.type_description(),
            });
        }
        Ok(Accessor::new(channel.offset, self.record_size))
    }

    /// Get an accessor that converts between element types.
    ///
    /// When the channel is absent and `default` is given, the accessor reads
    /// the default for every record and ignores writes.
    pub fn get_converting_accessor<T: ChannelValue>(
        &self,
        name: &str,
        default: Option<T>,
    ) -> Result<ConvertingAccessor<T>> {
        match (self.channel(name), default) {
            (Some(channel), _) => {
                if channel.arity != T::ARITY {
                    return Err(Error::TypeMismatch {
                        channel: name.to_string(),
                        expected: format!("{}[{}]", T::DATA_TYPE, T::ARITY),
                        found: channel.type_description(),
                    });
                }
                Ok(ConvertingAccessor::bound(
                    channel.offset,
                    channel.data_type,
                    self.record_size,
                ))
            }
            (None, Some(value)) => Ok(ConvertingAccessor::constant(value, self.record_size)),
            (None, None) => Err(Error::ChannelMissing(name.to_string())),
        }
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.record_size == other.record_size && self.channels == other.channels
    }
}

impl Eq for Schema {}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, channel) in self.channels.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}[{}]", channel.name, channel.data_type, channel.arity)?;
        }
        write!(f, "}}")
    }
}
