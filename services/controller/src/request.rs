//! Provisioning requests.
//!
//! A job's burst buffer request is a variant keyed by plugin kind
//! ([`RequestSpec`]). Everything the lifecycle needs from a request goes
//! through the [`Provisioning`] trait, so adding a plugin kind means adding a
//! variant and an implementation, never reinterpreting an opaque buffer.

use std::fmt;
use std::path::Path;

use lodbb_directives::{DirectiveError, LodRequest};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobInfo, JobOwner};

/// Plugin type string used in logs and job descriptions.
pub const PLUGIN_TYPE: &str = "burst_buffer/lod";

/// Burst buffer plugin kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    /// Lustre on demand.
    Lod,
}

/// A provisioning step driven through the external tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    StageIn,
    StageOut,
    Teardown,
}

impl Phase {
    /// Label used for the command runner, logs and job descriptions.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::StageIn => "stage_in",
            Self::StageOut => "stage_out",
            Self::Teardown => "teardown",
        }
    }

    /// Subcommand understood by the `lod` tool.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Setup => "start",
            Self::StageIn => "stage_in",
            Self::StageOut => "stage_out",
            Self::Teardown => "stop",
        }
    }

    /// Node list to use when the request has no explicit node selector.
    ///
    /// Before the job runs only its requested nodes are known; afterwards the
    /// allocation is authoritative.
    pub fn default_nodes<'a>(&self, job: &'a JobInfo) -> Option<&'a str> {
        let (first, second) = match self {
            Self::Setup | Self::StageIn => (&job.requested_nodes, &job.allocated_nodes),
            Self::StageOut | Self::Teardown => (&job.allocated_nodes, &job.requested_nodes),
        };
        first.as_deref().or(second.as_deref())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which phases a request asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFlags {
    pub setup: bool,
    pub stage_in: bool,
    pub stage_out: bool,
    pub teardown: bool,
}

impl PhaseFlags {
    pub fn is_empty(&self) -> bool {
        !(self.setup || self.stage_in || self.stage_out || self.teardown)
    }
}

impl fmt::Display for PhaseFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (self.setup, "setup"),
            (self.stage_in, "stage_in"),
            (self.stage_out, "stage_out"),
            (self.teardown, "teardown"),
        ]
        .iter()
        .filter(|(wanted, _)| *wanted)
        .map(|(_, name)| *name)
        .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

/// Behavior every plugin-specific request provides to the lifecycle.
pub trait Provisioning {
    fn kind(&self) -> PluginKind;

    fn phases(&self) -> PhaseFlags;

    fn is_empty(&self) -> bool {
        self.phases().is_empty()
    }

    /// Arguments (without the executable) for one phase of the external tool.
    fn command_args(&self, phase: Phase, default_nodes: Option<&str>) -> Vec<String>;
}

fn push_option(args: &mut Vec<String>, name: &str, value: Option<&str>) {
    if let Some(value) = value {
        args.push(format!("--{name}={value}"));
    }
}

impl Provisioning for LodRequest {
    fn kind(&self) -> PluginKind {
        PluginKind::Lod
    }

    fn phases(&self) -> PhaseFlags {
        PhaseFlags {
            setup: self.wants_setup(),
            stage_in: self.wants_stage_in(),
            stage_out: self.wants_stage_out(),
            teardown: self.wants_teardown(),
        }
    }

    fn command_args(&self, phase: Phase, default_nodes: Option<&str>) -> Vec<String> {
        let mut args = Vec::with_capacity(9);
        let opts = &self.options;

        push_option(&mut args, "node", opts.node.as_deref().or(default_nodes));
        push_option(&mut args, "mdtdevs", opts.mdtdevs.as_deref());
        push_option(&mut args, "ostdevs", opts.ostdevs.as_deref());
        push_option(&mut args, "inet", opts.inet.as_deref());
        push_option(&mut args, "mountpoint", opts.mountpoint.as_deref());

        match phase {
            Phase::StageIn => {
                if let Some(spec) = &self.stage_in {
                    push_option(&mut args, "source", spec.source.as_deref());
                    push_option(&mut args, "sourcelist", spec.source_list.as_deref());
                    push_option(&mut args, "destination", spec.destination.as_deref());
                }
            }
            Phase::StageOut => {
                if let Some(spec) = &self.stage_out {
                    push_option(&mut args, "sourcelist", spec.source_list.as_deref());
                    push_option(&mut args, "source", spec.source.as_deref());
                    push_option(&mut args, "destination", spec.destination.as_deref());
                }
            }
            Phase::Setup | Phase::Teardown => {}
        }

        args.push(phase.verb().to_string());
        args
    }
}

/// Burst buffer request keyed by plugin kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestSpec {
    Lod(LodRequest),
}

impl Provisioning for RequestSpec {
    fn kind(&self) -> PluginKind {
        match self {
            Self::Lod(request) => request.kind(),
        }
    }

    fn phases(&self) -> PhaseFlags {
        match self {
            Self::Lod(request) => request.phases(),
        }
    }

    fn command_args(&self, phase: Phase, default_nodes: Option<&str>) -> Vec<String> {
        match self {
            Self::Lod(request) => request.command_args(phase, default_nodes),
        }
    }
}

impl RequestSpec {
    /// Extract, validate and parse a batch script's directives.
    ///
    /// Returns `Ok(None)` for a script without directives.
    pub fn from_script(script: &str, lod_conf_path: &Path) -> Result<Option<Self>, DirectiveError> {
        let Some(text) = lodbb_directives::extract_directives(script) else {
            return Ok(None);
        };
        lodbb_directives::validate(&text, lod_conf_path)?;
        Ok(Some(Self::Lod(lodbb_directives::parse(&text)?)))
    }
}

impl From<LodRequest> for RequestSpec {
    fn from(request: LodRequest) -> Self {
        Self::Lod(request)
    }
}

/// Per-job provisioning request owned by a job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    pub job_id: JobId,
    pub owner: JobOwner,
    pub spec: RequestSpec,

    /// Setup completed successfully, so an allocation exists to tear down.
    pub started: bool,
}

impl ProvisioningRequest {
    /// Build the request for a job, if it carries a non-empty one.
    pub fn from_job(job: &JobInfo) -> Option<Self> {
        let spec = job.burst_buffer.as_ref().filter(|spec| !spec.is_empty())?;
        Some(Self {
            job_id: job.job_id,
            owner: job.owner.clone(),
            spec: spec.clone(),
            started: false,
        })
    }

    pub fn phases(&self) -> PhaseFlags {
        self.spec.phases()
    }

    /// Teardown needs the external tool only when an allocation was created
    /// and the job asked for it to be stopped.
    pub fn teardown_required(&self) -> bool {
        let phases = self.phases();
        phases.setup && phases.teardown && self.started
    }

    /// Full argument vector for a phase, filling in the job's nodes when the
    /// scheduler still knows the job.
    pub fn command_args(&self, phase: Phase, job: Option<&JobInfo>) -> Vec<String> {
        self.spec
            .command_args(phase, job.and_then(|job| phase.default_nodes(job)))
    }
}
