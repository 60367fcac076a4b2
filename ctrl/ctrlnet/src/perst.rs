// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCIe reset recovery.
//!
//! PERST quiesces a whole PCIe MAC domain: dispatch and heartbeats for the
//! PEM stop, the data plane is fenced off through [`DataPlaneHooks`], every
//! function under the PEM reloads its configured defaults, and the domain
//! comes back. FLR is the narrower per-function variant the host raises for
//! a single PF or a set of its VFs.

use crate::hierarchy::FunctionHierarchy;
use crate::hierarchy::PemResetError;
use thiserror::Error;

/// Reset events delivered by the platform's interrupt plumbing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CtrlEvent {
    /// PCIe reset of one PCIe MAC domain.
    Perst { pem: u8 },
    /// Function-level reset: the masked VFs of a PF, or the PF itself (and
    /// all of its VFs) when the mask is empty.
    Flr { pem: u8, pf: u16, vf_mask: u64 },
}

/// Data-plane quiesce callbacks around a PEM reset.
pub trait DataPlaneHooks {
    fn on_before_pem_reset(&mut self, pem: u8);
    fn on_after_pem_reset(&mut self, pem: u8);
}

/// Hooks for configurations with no data plane attached.
pub struct NullHooks;

impl DataPlaneHooks for NullHooks {
    fn on_before_pem_reset(&mut self, pem: u8) {
        tracing::debug!(pem, "before pem reset");
    }

    fn on_after_pem_reset(&mut self, pem: u8) {
        tracing::debug!(pem, "after pem reset");
    }
}

#[derive(Debug, Error)]
pub enum PerstError {
    #[error("reset event for unknown pem {0}")]
    UnknownPem(u8),
    #[error("flr event for unknown function pem {pem} pf {pf}")]
    UnknownPf { pem: u8, pf: u16 },
    /// The reload failed; the PEM stays quiesced and needs supervision.
    #[error(transparent)]
    Reload(#[from] PemResetError),
}

/// Coordinator state. `InPemReset` exists only within
/// [`PerstRecoveryCoordinator::handle_event`]; observed from outside it
/// means a reload failed and the PEM is parked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoordinatorState {
    Ready,
    InPemReset { pem: u8 },
    Uninit,
}

/// Drives function state recovery across PERST and FLR events.
pub struct PerstRecoveryCoordinator {
    state: CoordinatorState,
}

impl Default for PerstRecoveryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PerstRecoveryCoordinator {
    pub fn new() -> Self {
        Self {
            state: CoordinatorState::Ready,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Marks the coordinator terminally stopped (process teardown).
    pub fn uninit(&mut self) {
        self.state = CoordinatorState::Uninit;
    }

    /// Applies one reset event. Duplicate events are idempotent.
    ///
    /// On reload failure the affected PEM remains quiesced (its dispatch and
    /// heartbeats stay suppressed) and the error is surfaced for
    /// process-level supervision; other PEMs keep running.
    pub fn handle_event(
        &mut self,
        event: CtrlEvent,
        hier: &mut FunctionHierarchy,
        hooks: &mut dyn DataPlaneHooks,
    ) -> Result<(), PerstError> {
        if self.state == CoordinatorState::Uninit {
            return Ok(());
        }
        match event {
            CtrlEvent::Perst { pem } => self.handle_perst(pem, hier, hooks),
            CtrlEvent::Flr { pem, pf, vf_mask } => handle_flr(pem, pf, vf_mask, hier),
        }
    }

    fn handle_perst(
        &mut self,
        pem: u8,
        hier: &mut FunctionHierarchy,
        hooks: &mut dyn DataPlaneHooks,
    ) -> Result<(), PerstError> {
        if hier.pem(pem).is_none() {
            return Err(PerstError::UnknownPem(pem));
        }
        tracing::info!(pem, "perst: resetting pem");
        self.state = CoordinatorState::InPemReset { pem };
        hier.set_pem_in_reset(pem, true);

        hooks.on_before_pem_reset(pem);
        let reloaded = hier.reset_pem(pem);
        match reloaded {
            Ok(()) => {
                hooks.on_after_pem_reset(pem);
                hier.set_pem_in_reset(pem, false);
                self.state = CoordinatorState::Ready;
                tracing::info!(pem, "perst: pem ready");
                Ok(())
            }
            Err(err) => {
                // The PEM stays fenced; only supervision can bring it back.
                tracing::error!(pem, %err, "perst: reload failed, pem stays quiesced");
                self.state = CoordinatorState::Ready;
                Err(err.into())
            }
        }
    }
}

fn handle_flr(
    pem: u8,
    pf: u16,
    vf_mask: u64,
    hier: &mut FunctionHierarchy,
) -> Result<(), PerstError> {
    if hier.pf(pem, pf).is_none() {
        return Err(PerstError::UnknownPf { pem, pf });
    }
    if vf_mask == 0 {
        tracing::info!(pem, pf, "flr: resetting pf");
        hier.reset_pf(pem, pf)?;
    } else {
        for vf in 0..u64::BITS as u16 {
            if vf_mask & (1 << vf) != 0 {
                tracing::info!(pem, pf, vf, "flr: resetting vf");
                hier.reset_vf(pem, pf, vf)?;
            }
        }
    }
    Ok(())
}
