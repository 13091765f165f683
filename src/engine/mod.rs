pub mod command;
pub mod types;

use crate::{job::CancelFlag, workspace::Workspace};

pub use command::CommandEngine;
pub use types::{ExitState, ReconstructionParams, ReconstructionResult, ToolDiag};

/// The external, opaque photo-to-3D capability.
pub trait Reconstructor: Sync {
    fn doctor(&self) -> ToolDiag;

    /// Runs reconstruction over `ws.input_dir()` into `ws.output_dir()`.
    /// Never fails outright; spawn errors come back as a failed result with
    /// the error text in `logs`.
    fn run(
        &self,
        ws: &Workspace,
        params: &ReconstructionParams,
        cancel: &CancelFlag,
    ) -> ReconstructionResult;
}
