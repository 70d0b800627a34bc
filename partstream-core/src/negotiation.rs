//! Layout negotiation shared by single-delegate decorators

use crate::adaptor::SchemaAdaptor;
use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::stream::{check_default_record, ParticleStream};

/// The three layouts a decorator juggles after `set_schema`.
///
/// * *requested*: what the consumer asked for.
/// * *working*: `requested ∪ requirements`; the requested layout is a prefix
///   so a working record truncated to the requested size is a valid output.
/// * *upstream*: `working − outputs`, the layout requested from the delegate.
///
/// Records are pulled from the delegate in the upstream layout, widened into
/// the working layout (output channels start from the default record), handed
/// to the decorator, then truncated into the caller's buffer.
#[derive(Debug, Clone)]
pub struct Negotiated {
    requested: Schema,
    working: Schema,
    upstream: Schema,
    /// Upstream to working; `None` when both layouts are identical
    adaptor: Option<SchemaAdaptor>,
    working_default: Vec<u8>,
    scratch: Vec<u8>,
    working_buf: Vec<u8>,
}

impl Negotiated {
    /// Compute layouts for a decorator that reads `requirements` and writes
    /// the channels named in `outputs`
    pub fn new(requested: &Schema, requirements: &Schema, outputs: &[&str]) -> Result<Self> {
        let working = requested.union(requirements);
        let upstream = working.without(outputs);
        let adaptor = if upstream == working {
            None
        } else {
            Some(SchemaAdaptor::new(&working, &upstream)?)
        };

        let mut requested = requested.clone();
        requested.end_definition();

        Ok(Self {
            working_default: working.default_record(),
            requested,
            working,
            upstream,
            adaptor,
            scratch: Vec::new(),
            working_buf: Vec::new(),
        })
    }

    /// Layout written into caller buffers
    pub fn requested(&self) -> &Schema {
        &self.requested
    }

    /// Layout the decorator operates on
    pub fn working(&self) -> &Schema {
        &self.working
    }

    /// Layout to request from the delegate
    pub fn upstream(&self) -> &Schema {
        &self.upstream
    }

    /// Fail with `ChannelMissing` when a channel the decorator reads on top
    /// of the requested layout is not native to `delegate`.
    ///
    /// Requested channels may be covered by a default record later, but a
    /// channel only the decorator reads would silently be zero-filled.
    /// Delegates known to yield no records are exempt, so blank frames and
    /// lenient substitutions still assemble.
    pub fn check_delegate<S: ParticleStream + ?Sized>(&self, delegate: &S) -> Result<()> {
        if delegate.count() == Some(0) {
            return Ok(());
        }
        let native = delegate.native_schema();
        let missing = self
            .upstream
            .channels()
            .iter()
            .find(|c| !self.requested.has_channel(c.name()) && !native.has_channel(c.name()));
        match missing {
            Some(channel) => Err(Error::ChannelMissing(format!(
                "{} (read by a decorator, not produced by '{}')",
                channel.name(),
                delegate.name()
            ))),
            None => Ok(()),
        }
    }

    /// Check if records can flow straight from the delegate to the caller
    pub fn is_passthrough(&self) -> bool {
        self.adaptor.is_none() && self.working == self.requested
    }

    /// Store a default record given in the requested layout and return the
    /// matching default in the upstream layout, for the delegate
    pub fn set_default_record(&mut self, record: &[u8]) -> Result<Vec<u8>> {
        check_default_record(record, &self.requested)?;
        self.working_default[..record.len()].copy_from_slice(record);

        let back = SchemaAdaptor::new(&self.upstream, &self.working)?;
        let mut upstream_default = self.upstream.default_record();
        back.copy(&mut upstream_default, &self.working_default);
        Ok(upstream_default)
    }

    fn pull_one(&mut self, delegate: &mut dyn ParticleStream, working: &mut [u8]) -> Result<bool> {
        let Some(adaptor) = &self.adaptor else {
            return delegate.next(working);
        };
        self.scratch.resize(self.upstream.record_size(), 0);
        if !delegate.next(&mut self.scratch)? {
            return Ok(false);
        }
        working.copy_from_slice(&self.working_default);
        adaptor.copy(working, &self.scratch);
        Ok(true)
    }

    fn pull_into<F>(&mut self, delegate: &mut dyn ParticleStream, working: &mut [u8], f: &mut F) -> Result<bool>
    where
        F: FnMut(&mut [u8]) -> Result<bool>,
    {
        loop {
            if !self.pull_one(delegate, working)? {
                return Ok(false);
            }
            if f(working)? {
                return Ok(true);
            }
        }
    }

    /// Pull one record through `f`, which may edit the working record and
    /// returns `false` to drop it.
    ///
    /// Dropped records are replaced by pulling again, so `Ok(false)` always
    /// means the delegate is exhausted.
    pub fn next_with<F>(&mut self, delegate: &mut dyn ParticleStream, out: &mut [u8], mut f: F) -> Result<bool>
    where
        F: FnMut(&mut [u8]) -> Result<bool>,
    {
        if self.working == self.requested {
            return self.pull_into(delegate, out, &mut f);
        }

        let mut working = std::mem::take(&mut self.working_buf);
        working.resize(self.working.record_size(), 0);
        let result = self.pull_into(delegate, &mut working, &mut f);
        if let Ok(true) = result {
            out.copy_from_slice(&working[..out.len()]);
        }
        self.working_buf = working;
        result
    }

    /// Pull up to `capacity` working records into the working buffer,
    /// returning how many arrived
    fn pull_batch(&mut self, delegate: &mut dyn ParticleStream, capacity: usize) -> Result<usize> {
        let working_size = self.working.record_size();
        self.working_buf.resize(capacity * working_size, 0);

        let Some(adaptor) = &self.adaptor else {
            return fill(delegate, &mut self.working_buf, working_size, capacity);
        };

        let upstream_size = self.upstream.record_size();
        self.scratch.resize(capacity * upstream_size, 0);
        let count = fill(delegate, &mut self.scratch, upstream_size, capacity)?;
        adaptor.copy_batch(&mut self.working_buf, &self.scratch, count, Some(&self.working_default));
        Ok(count)
    }

    /// Batch form of [`Negotiated::next_with`] for decorators that never drop
    /// records: `f` receives the contiguous working records and their count.
    pub fn map_batch<F>(&mut self, delegate: &mut dyn ParticleStream, out: &mut [u8], mut f: F) -> Result<usize>
    where
        F: FnMut(&mut [u8], usize) -> Result<()>,
    {
        let requested_size = self.requested.record_size();
        if requested_size == 0 {
            return Err(Error::InvalidOperation(
                "zero-sized records cannot be read in batches".to_string(),
            ));
        }
        let capacity = out.len() / requested_size;

        if self.is_passthrough() {
            let count = delegate.next_batch(&mut out[..capacity * requested_size])?;
            f(&mut out[..count * requested_size], count)?;
            return Ok(count);
        }

        let count = self.pull_batch(delegate, capacity)?;
        let working_size = self.working.record_size();
        f(&mut self.working_buf[..count * working_size], count)?;
        copy_prefixes(&self.working_buf, working_size, out, requested_size, count);
        Ok(count)
    }

    /// Batch form of [`Negotiated::next_with`] for decorators that drop
    /// records; keeps pulling until `out` is full or the delegate ends.
    pub fn filter_batch<F>(&mut self, delegate: &mut dyn ParticleStream, out: &mut [u8], mut keep: F) -> Result<usize>
    where
        F: FnMut(&mut [u8]) -> Result<bool>,
    {
        let requested_size = self.requested.record_size();
        if requested_size == 0 {
            return Err(Error::InvalidOperation(
                "zero-sized records cannot be read in batches".to_string(),
            ));
        }
        let capacity = out.len() / requested_size;
        let working_size = self.working.record_size();

        let mut filled = 0;
        while filled < capacity {
            let wanted = capacity - filled;
            let count = self.pull_batch(delegate, wanted)?;
            for i in 0..count {
                let record = &mut self.working_buf[i * working_size..(i + 1) * working_size];
                if keep(record)? {
                    out[filled * requested_size..(filled + 1) * requested_size]
                        .copy_from_slice(&record[..requested_size]);
                    filled += 1;
                }
            }
            if count < wanted {
                break;
            }
        }
        Ok(filled)
    }
}

/// Fill up to `capacity` records of `size` bytes, falling back to single
/// pulls for zero-sized layouts
fn fill(delegate: &mut dyn ParticleStream, buffer: &mut [u8], size: usize, capacity: usize) -> Result<usize> {
    if size > 0 {
        return delegate.next_batch(&mut buffer[..capacity * size]);
    }
    let mut count = 0;
    while count < capacity && delegate.next(&mut [])? {
        count += 1;
    }
    Ok(count)
}

fn copy_prefixes(src: &[u8], src_size: usize, dest: &mut [u8], dest_size: usize, count: usize) {
    if src_size == dest_size {
        dest[..count * dest_size].copy_from_slice(&src[..count * src_size]);
        return;
    }
    for i in 0..count {
        dest[i * dest_size..(i + 1) * dest_size]
            .copy_from_slice(&src[i * src_size..i * src_size + dest_size]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Channel;
    use glam::Vec3;

    #[test]
    fn test_layouts() {
        let requested = Schema::new(vec![Channel::of::<Vec3>("Color")]).unwrap();
        let requirements = Schema::new(vec![Channel::of::<Vec3>("Position")]).unwrap();
        let negotiated = Negotiated::new(&requested, &requirements, &["Color"]).unwrap();

        assert_eq!(negotiated.working().channels()[0].name(), "Color");
        assert_eq!(negotiated.working().record_size(), 24);
        assert_eq!(negotiated.upstream(), &requirements);
        assert!(!negotiated.is_passthrough());
    }

    #[test]
    fn test_passthrough_when_nothing_added() {
        let requested = Schema::new(vec![Channel::of::<Vec3>("Position")]).unwrap();
        let negotiated = Negotiated::new(&requested, &Schema::empty(), &[]).unwrap();
        assert!(negotiated.is_passthrough());
    }

    #[test]
    fn test_default_record_maps_to_upstream() {
        let requested = Schema::new(vec![Channel::of::<f32>("Density"), Channel::of::<Vec3>("Color")]).unwrap();
        let mut negotiated = Negotiated::new(&requested, &Schema::empty(), &["Color"]).unwrap();

        let mut record = requested.default_record();
        requested.get_accessor::<f32>("Density").unwrap().set(&mut record, 4.0);
        let upstream_default = negotiated.set_default_record(&record).unwrap();

        let upstream = negotiated.upstream();
        assert_eq!(upstream.len(), 1);
        assert_eq!(upstream.get_accessor::<f32>("Density").unwrap().get(&upstream_default), 4.0);
        assert!(negotiated.set_default_record(&[0u8; 3]).is_err());
    }

    /// Records of a fixed layout that are never pulled
    struct Fixed {
        native: Schema,
        count: u64,
    }

    impl ParticleStream for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn schema(&self) -> &Schema {
            &self.native
        }

        fn native_schema(&self) -> &Schema {
            &self.native
        }

        fn set_schema(&mut self, _requested: &Schema) -> Result<()> {
            Ok(())
        }

        fn set_default_record(&mut self, _record: &[u8]) -> Result<()> {
            Ok(())
        }

        fn next(&mut self, _record: &mut [u8]) -> Result<bool> {
            Ok(false)
        }

        fn count(&self) -> Option<u64> {
            Some(self.count)
        }

        fn position(&self) -> u64 {
            0
        }
    }

    #[test]
    fn test_check_delegate() {
        let velocity = Schema::new(vec![Channel::of::<Vec3>("Velocity")]).unwrap();
        let position = Schema::new(vec![Channel::of::<Vec3>("Position")]).unwrap();
        let delegate = |count| Fixed {
            native: velocity.clone(),
            count,
        };

        // Read only by the decorator and absent upstream
        let reads_position = Negotiated::new(&velocity, &position, &[]).unwrap();
        assert!(matches!(
            reads_position.check_delegate(&delegate(3)),
            Err(Error::ChannelMissing(_))
        ));
        assert!(reads_position.check_delegate(&delegate(0)).is_ok());

        // Requested channels are left to `negotiate` and default records
        let requested = velocity.union(&position);
        let both = Negotiated::new(&requested, &position, &[]).unwrap();
        assert!(both.check_delegate(&delegate(3)).is_ok());

        // Written channels are not read from upstream
        let writes_position = Negotiated::new(&velocity, &position, &["Position"]).unwrap();
        assert!(writes_position.check_delegate(&delegate(3)).is_ok());
    }
}
