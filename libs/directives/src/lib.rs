//! `#LOD` burst buffer directives.
//!
//! Batch scripts request a Lustre-on-demand burst buffer through comment
//! directives placed before the first command:
//!
//! ```text
//! #!/bin/bash
//! #LOD setup node=cn[01-04] mdtdevs=/dev/sdb ostdevs=/dev/sdc \
//! #LOD       mountpoint=/mnt/lod
//! #LOD stage_in source=/home/alice/input destination=/mnt/lod/input
//! #LOD stage_out source=/mnt/lod/output destination=/home/alice/output
//! #LOD stop
//! srun ./app
//! ```
//!
//! This crate turns that text into a typed [`LodRequest`]:
//!
//! - [`extract_directives`] pulls the `#LOD` lines out of a script and merges
//!   `\` continuations
//! - [`validate`] performs submit-time checks
//! - [`parse`] builds the request consumed by the lifecycle controller

mod error;
mod request;
mod script;

pub use error::DirectiveError;
pub use request::{parse, validate, LodRequest, SetupOptions, StageSpec};
pub use script::{extract_directives, DIRECTIVE_PREFIX};

/// Default location of the LOD tool configuration file.
///
/// `setup` directives that omit `mdtdevs=` or `ostdevs=` rely on it.
pub const DEFAULT_LOD_CONF: &str = "/etc/lod.conf";
