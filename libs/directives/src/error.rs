//! Directive errors.

use thiserror::Error;

/// Errors raised while validating or parsing `#LOD` directives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    /// `setup` omitted device lists and no LOD config file is available.
    #[error("line {line}: setup without mdtdevs= and ostdevs= requires {conf_path}")]
    MissingLodConfig { line: usize, conf_path: String },

    /// A staging directive is missing its source or destination.
    #[error("line {line}: {directive} requires source= (or sourcelist=) and destination=")]
    MissingStagePaths {
        line: usize,
        directive: &'static str,
    },

    /// `stop` was requested without a `setup` to tear down.
    #[error("stop requires setup")]
    StopWithoutSetup,

    /// An option was given with no value (`node=`).
    #[error("line {line}: option '{key}' has an empty value")]
    EmptyValue { line: usize, key: String },
}

impl DirectiveError {
    /// Line number (1-based, within the merged directives) the error refers to.
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::MissingLodConfig { line, .. }
            | Self::MissingStagePaths { line, .. }
            | Self::EmptyValue { line, .. } => Some(*line),
            Self::StopWithoutSetup => None,
        }
    }
}
