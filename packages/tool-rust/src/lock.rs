//! Distributed configuration lock.
//!
//! A lock is a `LockConfig` change recorded in the configuration log. The
//! holder keeps the token and wraps every later change with it until the
//! lock is released by an `UnlockConfig` change.

use dynconf_core::{Cluster, HostPort, LockContext, NomadChange, Uid};
use tracing::{info, warn};

use crate::connectivity::{get_upcoming_cluster, run_configuration_change};
use crate::context::OrchestrationContext;
use crate::discovery::{are_all_nodes_activated, ensure_nodes_are_either_active_or_passive, find_online_runtime_peers};
use crate::error::{ToolError, ToolResult};
use crate::node_states::NodeStates;

pub const SCALE_OUT_PREFIX: &str = "scale-out-";
pub const SCALE_IN_PREFIX: &str = "scale-in-";
pub const NODE_ADD_PREFIX: &str = "node-add-";
pub const NODE_DEL_PREFIX: &str = "node-del-";

#[must_use]
pub fn scale_out_tag(stripe: &Uid) -> String {
    format!("{SCALE_OUT_PREFIX}{stripe}")
}

#[must_use]
pub fn scale_in_tag(stripe: &Uid) -> String {
    format!("{SCALE_IN_PREFIX}{stripe}")
}

#[must_use]
pub fn node_add_tag(node: &Uid) -> String {
    format!("{NODE_ADD_PREFIX}{node}")
}

/// Tag for removing `nodes`, UIDs joined with `:`.
#[must_use]
pub fn node_del_tag<'a>(nodes: impl IntoIterator<Item = &'a Uid>) -> String {
    let uids: Vec<&str> = nodes.into_iter().map(Uid::as_str).collect();
    format!("{NODE_DEL_PREFIX}{}", uids.join(":"))
}

/// Locks the configuration of `nodes`. Returns a context whose changes
/// carry the new token, and the locked cluster that later changes must
/// build on.
///
/// # Errors
///
/// Fails when the `LockConfig` change is not committed.
pub async fn acquire(
    ctx: &OrchestrationContext,
    base: &Cluster,
    nodes: &NodeStates,
    tag: &str,
) -> ToolResult<(OrchestrationContext, Cluster)> {
    let lock = LockContext::new(ctx.config().lock_owner.clone(), tag);
    info!("Locking the configuration for {}", lock.owner_info());
    let token = lock.token.clone();
    let change = NomadChange::lock_config(base, lock);
    let locked = change.result_cluster().clone();
    run_configuration_change(ctx, base, &nodes.passives_first(), change).await?;
    Ok((ctx.with_lock_token(token), locked))
}

/// Releases the lock held by `ctx`.
///
/// # Errors
///
/// Fails when the `UnlockConfig` change is not committed.
pub async fn release(ctx: &OrchestrationContext, base: &Cluster, nodes: &NodeStates) -> ToolResult<()> {
    info!("Unlocking the configuration");
    run_configuration_change(ctx, base, &nodes.passives_first(), NomadChange::unlock_config(base, false)).await
}

/// Clears any lock regardless of its holder.
///
/// # Errors
///
/// Fails when the forced `UnlockConfig` change is not committed.
pub async fn force_release(ctx: &OrchestrationContext, base: &Cluster, nodes: &NodeStates) -> ToolResult<()> {
    warn!("Forcefully unlocking the configuration");
    run_configuration_change(ctx, base, &nodes.passives_first(), NomadChange::unlock_config(base, true)).await
}

/// Releases the lock after `outcome`, keeping the first error. A release
/// failure after an earlier error is only logged.
///
/// # Errors
///
/// Returns the error of `outcome`, or the release error when `outcome`
/// succeeded.
pub async fn release_after<T>(
    ctx: &OrchestrationContext,
    base: &Cluster,
    nodes: &NodeStates,
    outcome: ToolResult<T>,
) -> ToolResult<T> {
    let released = release(ctx, base, nodes).await;
    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_error)) => {
            warn!("Unable to release the configuration lock: {release_error}");
            Err(e)
        }
    }
}

async fn activated_peers(ctx: &OrchestrationContext, seed: &HostPort) -> ToolResult<(Cluster, NodeStates)> {
    let online = find_online_runtime_peers(ctx, seed).await?;
    if !are_all_nodes_activated(ctx, &online).await? {
        return Err(ToolError::validation(
            "Configuration lock is only available on activated clusters",
        ));
    }
    ensure_nodes_are_either_active_or_passive(ctx, &online).await?;
    Ok((get_upcoming_cluster(ctx, seed).await?, online))
}

/// Locks the configuration of the cluster reached through `seed` and
/// returns the lock token.
///
/// # Errors
///
/// Fails when the cluster is not activated, already locked, or when the
/// lock change fails.
pub async fn lock_cluster(
    ctx: &OrchestrationContext,
    seed: &HostPort,
    owner: Option<&str>,
    tag: &str,
) -> ToolResult<String> {
    let (base, online) = activated_peers(ctx, seed).await?;
    if let Some(current) = &base.lock_context {
        return Err(ToolError::validation(format!(
            "Configuration is already locked by '{}'",
            current.owner_info()
        )));
    }
    let owner = owner.map_or_else(|| ctx.config().lock_owner.clone(), ToString::to_string);
    let lock = LockContext::new(owner, tag);
    let token = lock.token.clone();
    run_configuration_change(ctx, &base, &online.passives_first(), NomadChange::lock_config(&base, lock)).await?;
    info!("Configuration locked with token: {token}");
    Ok(token)
}

/// Unlocks the configuration with `token`, or clears any lock when
/// `forced`.
///
/// # Errors
///
/// Fails when the cluster is not activated, not locked, or when the unlock
/// change fails.
pub async fn unlock_cluster(
    ctx: &OrchestrationContext,
    seed: &HostPort,
    token: Option<&str>,
    forced: bool,
) -> ToolResult<()> {
    let (base, online) = activated_peers(ctx, seed).await?;
    if forced {
        return force_release(ctx, &base, &online).await;
    }
    let Some(current) = &base.lock_context else {
        return Err(ToolError::validation("Configuration is not locked"));
    };
    let Some(token) = token else {
        return Err(ToolError::validation(format!(
            "A lock token is required to unlock the configuration locked by '{}'",
            current.owner_info()
        )));
    };
    release(&ctx.with_lock_token(token), &base, &online).await
}
