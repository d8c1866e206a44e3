//! Error handling and display for the CLI.

use colored::Colorize;
use lodbb_controller::{ConfigError, ControllerError};
use lodbb_directives::DirectiveError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0} contains no #LOD directives")]
    NoDirectives(String),

    #[error("JobId={job_id}: burst buffer failed in state {state}: {description}")]
    Failed {
        job_id: u32,
        state: String,
        description: String,
    },

    #[error("interrupted")]
    Interrupted,
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(hint) = hint(err) {
        eprintln!("\n{}", format!("Hint: {hint}").yellow());
    }
}

fn hint(err: &anyhow::Error) -> Option<&'static str> {
    let directive = err.downcast_ref::<DirectiveError>().or_else(|| {
        match err.downcast_ref::<ControllerError>() {
            Some(ControllerError::Directive(e)) => Some(e),
            _ => None,
        }
    });
    if let Some(directive) = directive {
        return Some(match directive {
            DirectiveError::MissingLodConfig { .. } => {
                "Pass mdtdevs= and ostdevs= on the setup line, or point LODBB_CONF_PATH at lod.conf."
            }
            DirectiveError::MissingStagePaths { .. } => {
                "Stage directives need source= (or sourcelist=) and destination=."
            }
            DirectiveError::StopWithoutSetup => "Add a `#LOD setup` line before `#LOD stop`.",
            DirectiveError::EmptyValue { .. } => "Remove the empty option or give it a value.",
        });
    }

    if err.downcast_ref::<ConfigError>().is_some() {
        return Some("Check the LODBB_* environment variables or the --config file.");
    }

    match err.downcast_ref::<CliError>() {
        Some(CliError::NoDirectives(_)) => {
            Some("Directives must appear before the first command, e.g. `#LOD setup ...`.")
        }
        Some(CliError::Failed { .. }) => Some("Re-run with --log-level debug to see command output."),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_for_directive_errors() {
        let err = anyhow::Error::new(DirectiveError::StopWithoutSetup);
        assert!(hint(&err).unwrap().contains("#LOD setup"));

        let wrapped = anyhow::Error::new(ControllerError::Directive(DirectiveError::EmptyValue {
            line: 1,
            key: "node".to_string(),
        }));
        assert!(hint(&wrapped).is_some());
    }

    #[test]
    fn test_no_hint_for_interrupt() {
        assert!(hint(&anyhow::Error::new(CliError::Interrupted)).is_none());
    }
}
