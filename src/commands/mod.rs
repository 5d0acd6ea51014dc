pub mod dispatch;
pub mod lock;
pub mod rate_limit;
pub mod schema;
pub mod unsling;
pub mod worker;

use crate::dispatch::{DispatchError, ErrorKind, UnslingError};
use crate::error::ExitError;

/// Map a dispatch failure onto the process exit taxonomy, keeping the
/// full cause chain in the message. A companion tool failure (missing
/// binary, non-zero exit, timeout) keeps the tool's own exit code.
pub fn dispatch_exit_error(e: DispatchError) -> anyhow::Error {
    let kind = e.kind();
    let err = anyhow::Error::new(e);
    let wrap: fn(String) -> ExitError = match kind {
        ErrorKind::AdmissionDenied => ExitError::AdmissionDenied,
        ErrorKind::Conflict => ExitError::Conflict,
        ErrorKind::Validation => ExitError::Config,
        ErrorKind::Integrity => ExitError::Integrity,
        ErrorKind::Failed => {
            if let Some(tool) = err.chain().find_map(|c| c.downcast_ref::<ExitError>()) {
                let context: Vec<String> = err
                    .chain()
                    .take_while(|c| !c.is::<ExitError>())
                    .map(ToString::to_string)
                    .collect();
                return anyhow::Error::new(tool.clone()).context(context.join(": "));
            }
            ExitError::Other
        }
    };
    wrap(format!("{err:#}")).into()
}

pub fn unsling_exit_error(e: UnslingError) -> anyhow::Error {
    let wrap: fn(String) -> ExitError = match &e {
        UnslingError::MissingBead => ExitError::Config,
        UnslingError::Incomplete { .. } => ExitError::Conflict,
        UnslingError::NotFound(..) | UnslingError::Update(_) => ExitError::Other,
    };
    wrap(format!("{:#}", anyhow::Error::new(e))).into()
}
