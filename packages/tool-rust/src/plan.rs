//! Change plans: one value per command, and the dispatcher running them.

use dynconf_core::{HostPort, Operation};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::context::OrchestrationContext;
use crate::diagnostic::{diagnose, DiagnosticReport};
use crate::error::ToolResult;
use crate::lock::{lock_cluster, unlock_cluster};
use crate::mutation::{mutate, MutationPlan};
use crate::repair::{repair, RepairPlan};
use crate::topology::{attach, detach, AttachPlan, DetachPlan};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockPlan {
    pub seed: HostPort,
    /// Defaults to [`ToolConfig::lock_owner`](crate::config::ToolConfig).
    #[serde(default)]
    pub owner: Option<String>,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockPlan {
    pub seed: HostPort,
    #[serde(default)]
    pub token: Option<String>,
    /// Clears the lock whoever holds it.
    #[serde(default)]
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosePlan {
    pub seed: HostPort,
}

/// A command and its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ChangePlan {
    Attach(AttachPlan),
    Detach(DetachPlan),
    SetConfig(MutationPlan),
    UnsetConfig(MutationPlan),
    Repair(RepairPlan),
    Lock(LockPlan),
    Unlock(UnlockPlan),
    Diagnose(DiagnosePlan),
}

impl ChangePlan {
    #[must_use]
    pub fn command(&self) -> &'static str {
        match self {
            Self::Attach(_) => "attach",
            Self::Detach(_) => "detach",
            Self::SetConfig(_) => "set",
            Self::UnsetConfig(_) => "unset",
            Self::Repair(_) => "repair",
            Self::Lock(_) => "lock",
            Self::Unlock(_) => "unlock",
            Self::Diagnose(_) => "diagnostic",
        }
    }
}

/// What a successful plan produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    Done,
    Locked { token: String },
    Diagnostic(Box<DiagnosticReport>),
}

/// Runs `plan` to completion.
///
/// # Errors
///
/// Returns the error of the command that failed.
pub async fn execute(ctx: &OrchestrationContext, plan: &ChangePlan) -> ToolResult<PlanOutcome> {
    let command = plan.command();
    let span = info_span!("plan", command, run_id = %Uuid::new_v4());
    let outcome = dispatch(ctx, plan).instrument(span).await;
    let label = match &outcome {
        Ok(_) => "ok",
        Err(e) => e.category(),
    };
    metrics::counter!("dynconf_plans_total", "command" => command, "outcome" => label).increment(1);
    outcome
}

async fn dispatch(ctx: &OrchestrationContext, plan: &ChangePlan) -> ToolResult<PlanOutcome> {
    match plan {
        ChangePlan::Attach(p) => attach(ctx, p).await.map(|()| PlanOutcome::Done),
        ChangePlan::Detach(p) => detach(ctx, p).await.map(|()| PlanOutcome::Done),
        ChangePlan::SetConfig(p) => mutate(ctx, Operation::Set, p).await.map(|()| PlanOutcome::Done),
        ChangePlan::UnsetConfig(p) => mutate(ctx, Operation::Unset, p).await.map(|()| PlanOutcome::Done),
        ChangePlan::Repair(p) => repair(ctx, p).await.map(|()| PlanOutcome::Done),
        ChangePlan::Lock(p) => {
            let token = lock_cluster(ctx, &p.seed, p.owner.as_deref(), &p.tag).await?;
            Ok(PlanOutcome::Locked { token })
        }
        ChangePlan::Unlock(p) => unlock_cluster(ctx, &p.seed, p.token.as_deref(), p.forced)
            .await
            .map(|()| PlanOutcome::Done),
        ChangePlan::Diagnose(p) => Ok(PlanOutcome::Diagnostic(Box::new(diagnose(ctx, &p.seed).await?))),
    }
}
