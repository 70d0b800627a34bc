//! Assembly of particle chains for a host application
//!
//! A [`ParticleLoader`] turns host settings and an explicit
//! [`RenderContext`] into a negotiated decorator chain for each request:
//!
//! - [`settings`]: host key/value settings and their typed form
//! - [`frames`]: scene time to sequence frames, and per-frame file loading
//! - [`modifiers`]: configurable modifier stacks
//! - [`context`]: what the host provides (time, transform, material) and
//!   receives (bounds, errors)
//! - [`loader`]: render chains and cached viewer particles
//!
//! ```no_run
//! use partstream_core::{Channel, Schema};
//! use partstream_pipeline::{LoaderSettings, ParticleLoader, SceneContext};
//! use glam::Vec3;
//!
//! let mut settings = LoaderSettings::default();
//! settings.files.push("/data/cloud_0000.prt".into());
//! let mut loader = ParticleLoader::new("cloud", settings);
//!
//! let requested = Schema::new(vec![Channel::of::<Vec3>("Position")])?;
//! let _stream = loader.render_stream(&SceneContext::new(1.5), &requested)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]

pub mod context;
pub mod error;
pub mod frames;
pub mod loader;
pub mod modifiers;
pub mod settings;
pub mod shaders;

pub use context::{Material, RenderContext, SceneContext, ShaderMaterial};
pub use error::PipelineError;
pub use frames::{open_frame, FrameRange, FrameSample, FrameTiming, RangeMode, SequenceOptions};
pub use loader::{viewer_schema, ParticleLoader};
pub use modifiers::ModifierSpec;
pub use settings::{CullingSettings, LoadLimits, LoaderSettings, PropertyMap};
pub use shaders::GradientShader;

/// Opaque handle of one viewer of a loader
pub type ViewerKey = partstream_cache::ConsumerKey;
