//! Typed burst buffer request and the parser that builds it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::DirectiveError;
use crate::script::DIRECTIVE_PREFIX;

/// Options shared by every LOD invocation of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupOptions {
    /// Node selector. When absent the job's own node list is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    /// Metadata target devices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mdtdevs: Option<String>,

    /// Object storage target devices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ostdevs: Option<String>,

    /// Network endpoint (LNet network name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inet: Option<String>,

    /// Client mount point of the on-demand file system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
}

/// Source and destination of a stage-in or stage-out copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// File listing the sources, one per line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_list: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl StageSpec {
    fn is_complete(&self) -> bool {
        (self.source.is_some() || self.source_list.is_some()) && self.destination.is_some()
    }
}

/// Structured Lustre-on-demand request for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LodRequest {
    /// A `setup` directive was given.
    pub setup: bool,

    /// A `stop` directive was given.
    pub stop: bool,

    /// Options from the `setup` directive.
    #[serde(default)]
    pub options: SetupOptions,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_in: Option<StageSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_out: Option<StageSpec>,
}

impl LodRequest {
    pub fn wants_setup(&self) -> bool {
        self.setup
    }

    pub fn wants_stage_in(&self) -> bool {
        self.stage_in.is_some()
    }

    pub fn wants_stage_out(&self) -> bool {
        self.stage_out.is_some()
    }

    pub fn wants_teardown(&self) -> bool {
        self.stop
    }

    /// True when no phase was requested at all.
    pub fn is_empty(&self) -> bool {
        !self.setup && !self.stop && self.stage_in.is_none() && self.stage_out.is_none()
    }
}

/// Directive verbs understood by the LOD plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Setup,
    StageIn,
    StageOut,
    Stop,
}

impl Verb {
    fn name(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::StageIn => "stage_in",
            Self::StageOut => "stage_out",
            Self::Stop => "stop",
        }
    }
}

/// A single `#LOD` line split into its verb and `key=value` options.
struct Directive<'a> {
    line: usize,
    verb: Verb,
    options: Vec<(&'a str, &'a str)>,
}

impl<'a> Directive<'a> {
    fn has(&self, key: &str) -> bool {
        self.options.iter().any(|(k, _)| *k == key)
    }

    fn value(&self, key: &str) -> Result<Option<String>, DirectiveError> {
        let value = self
            .options
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v);
        match value {
            Some("") => Err(DirectiveError::EmptyValue {
                line: self.line,
                key: key.to_string(),
            }),
            Some(v) => Ok(Some(v.to_string())),
            None => Ok(None),
        }
    }

    fn stage_spec(&self) -> Result<StageSpec, DirectiveError> {
        Ok(StageSpec {
            source: self.value("source")?,
            source_list: self.value("sourcelist")?,
            destination: self.value("destination")?,
        })
    }
}

/// Split merged directives into recognized `#LOD` lines.
///
/// Unknown verbs and tokens without `=` are ignored, matching how the LOD
/// tool treats them.
fn directives(text: &str) -> impl Iterator<Item = Directive<'_>> {
    text.lines().enumerate().filter_map(|(idx, line)| {
        let body = line.strip_prefix(DIRECTIVE_PREFIX)?.trim_start();
        let verb = if body.starts_with("setup") {
            Verb::Setup
        } else if body.starts_with("stage_in") {
            Verb::StageIn
        } else if body.starts_with("stage_out") {
            Verb::StageOut
        } else if body.starts_with("stop") {
            Verb::Stop
        } else {
            return None;
        };
        let options = body
            .split_whitespace()
            .skip(1)
            .filter_map(|token| token.split_once('='))
            .collect();
        Some(Directive {
            line: idx + 1,
            verb,
            options,
        })
    })
}

/// Submit-time validation of merged directives.
///
/// `lod_conf_path` is consulted only when a `setup` directive omits its
/// device lists.
pub fn validate(text: &str, lod_conf_path: &Path) -> Result<(), DirectiveError> {
    let mut setup = false;
    let mut stop = false;

    for directive in directives(text) {
        match directive.verb {
            Verb::Setup => {
                setup = true;
                if (!directive.has("mdtdevs") || !directive.has("ostdevs"))
                    && !lod_conf_path.exists()
                {
                    return Err(DirectiveError::MissingLodConfig {
                        line: directive.line,
                        conf_path: lod_conf_path.display().to_string(),
                    });
                }
            }
            Verb::StageIn | Verb::StageOut => {
                let spec = directive.stage_spec()?;
                if !spec.is_complete() {
                    return Err(DirectiveError::MissingStagePaths {
                        line: directive.line,
                        directive: directive.verb.name(),
                    });
                }
            }
            Verb::Stop => stop = true,
        }
    }

    if stop && !setup {
        return Err(DirectiveError::StopWithoutSetup);
    }
    Ok(())
}

/// Parse merged directives into a [`LodRequest`].
///
/// A later `stage_in` or `stage_out` directive replaces an earlier one.
pub fn parse(text: &str) -> Result<LodRequest, DirectiveError> {
    let mut request = LodRequest::default();

    for directive in directives(text) {
        match directive.verb {
            Verb::Setup => {
                request.setup = true;
                request.options = SetupOptions {
                    node: directive.value("node")?,
                    mdtdevs: directive.value("mdtdevs")?,
                    ostdevs: directive.value("ostdevs")?,
                    inet: directive.value("inet")?,
                    mountpoint: directive.value("mountpoint")?,
                };
            }
            Verb::StageIn => request.stage_in = Some(directive.stage_spec()?),
            Verb::StageOut => request.stage_out = Some(directive.stage_spec()?),
            Verb::Stop => request.stop = true,
        }
    }

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "#LOD setup node=cn[01-02] mdtdevs=/dev/sdb ostdevs=/dev/sdc inet=o2ib0 mountpoint=/mnt/lod\n\
                        #LOD stage_in source=/home/a/in destination=/mnt/lod/in\n\
                        #LOD stage_out sourcelist=/home/a/list destination=/home/a/out\n\
                        #LOD stop";

    #[test]
    fn test_parse_full_request() {
        let request = parse(FULL).unwrap();

        assert!(request.wants_setup());
        assert!(request.wants_stage_in());
        assert!(request.wants_stage_out());
        assert!(request.wants_teardown());
        assert_eq!(request.options.node.as_deref(), Some("cn[01-02]"));
        assert_eq!(request.options.inet.as_deref(), Some("o2ib0"));
        assert_eq!(request.options.mountpoint.as_deref(), Some("/mnt/lod"));

        let stage_out = request.stage_out.unwrap();
        assert_eq!(stage_out.source, None);
        assert_eq!(stage_out.source_list.as_deref(), Some("/home/a/list"));
    }

    #[test]
    fn test_parse_later_stage_in_replaces_earlier() {
        let text = "#LOD stage_in source=/a destination=/b\n#LOD stage_in source=/c destination=/d";
        let request = parse(text).unwrap();
        let stage_in = request.stage_in.unwrap();
        assert_eq!(stage_in.source.as_deref(), Some("/c"));
        assert_eq!(stage_in.destination.as_deref(), Some("/d"));
    }

    #[test]
    fn test_parse_ignores_unknown_verbs() {
        let request = parse("#LOD frobnicate x=1").unwrap();
        assert!(request.is_empty());
    }

    #[test]
    fn test_parse_empty_value() {
        let err = parse("#LOD setup node=").unwrap_err();
        assert_eq!(
            err,
            DirectiveError::EmptyValue {
                line: 1,
                key: "node".to_string()
            }
        );
    }

    #[test]
    fn test_validate_full_request() {
        assert!(validate(FULL, Path::new("/nonexistent/lod.conf")).is_ok());
    }

    #[test]
    fn test_validate_stop_without_setup() {
        let err = validate("#LOD stop", Path::new("/nonexistent")).unwrap_err();
        assert_eq!(err, DirectiveError::StopWithoutSetup);
    }

    #[test]
    fn test_validate_stage_out_requires_destination() {
        let text = "#LOD setup mdtdevs=/dev/a ostdevs=/dev/b\n#LOD stage_out source=/mnt/x";
        let err = validate(text, Path::new("/nonexistent")).unwrap_err();
        assert_eq!(
            err,
            DirectiveError::MissingStagePaths {
                line: 2,
                directive: "stage_out"
            }
        );
    }
}
