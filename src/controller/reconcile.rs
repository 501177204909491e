use super::crd::{AttackResponse, AttackResponseStatus, Phase};
use super::decoys::{self, VARIANTS};
use super::events::{EventBus, EventKind};
use super::manager::ManagerClient;
use crate::config::ControllerConfig;
use crate::error::Error;
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Shared reconciler context.
pub struct Ctx {
    pub client: Client,
    pub cfg: ControllerConfig,
    pub manager: ManagerClient,
    pub bus: EventBus,
    /// Consecutive reconcile failures per resource; cleared on success.
    pub failures: DashMap<String, u32>,
}

/// Give up and park the resource in Failed after this many consecutive
/// failed reconciles; the TTL still deletes it.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Pause between decoy creations to spread startup cost.
const CREATE_STAGGER: Duration = Duration::from_millis(500);
/// Upper bound between reconciles, so the TTL check runs near the deadline.
const REQUEUE_CAP: Duration = Duration::from_secs(60);
/// Backoff applied by the error policy between failed reconciles.
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

pub async fn reconcile(ar: Arc<AttackResponse>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    metrics::counter!("mirage_reconcile_total").increment(1);

    let name = ar.name_any();
    let ns = ar.namespace().unwrap_or_else(|| ctx.cfg.namespace.clone());
    let api: Api<AttackResponse> = Api::namespaced(ctx.client.clone(), &ns);

    // already being deleted: owned objects cascade, nothing to drive
    if ar.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let status = ar.status.clone().unwrap_or_default();

    // First sight: stamp the lifecycle clock, then come straight back.
    if status.created_at.is_none() {
        let now = Utc::now();
        let due = now + chrono::Duration::minutes(ar.spec.auto_cleanup_minutes.max(1));
        let initial = AttackResponseStatus {
            phase: Phase::Pending,
            created_at: Some(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
            cleanup_scheduled_at: Some(due.to_rfc3339_opts(SecondsFormat::Secs, true)),
            message: Some("response accepted".to_string()),
            ..Default::default()
        };
        patch_status(&api, &name, &initial).await?;
        info!(
            action = "response_pending",
            response = %name,
            source_ip = %ar.spec.source_ip,
            cleanup_at = %initial.cleanup_scheduled_at.as_deref().unwrap_or(""),
            "attack response admitted"
        );
        return Ok(Action::requeue(Duration::ZERO));
    }

    // TTL: past the deadline the resource is torn down regardless of phase.
    if status.expired(Utc::now()) {
        return teardown(&api, &ar, &name, &ctx).await;
    }

    let step = match status.phase {
        Phase::Pending | Phase::Creating => ensure_fleet(&ar, &name, &ns, status.clone(), &ctx, &api).await,
        // terminal-ish phases just wait for the TTL
        Phase::Active | Phase::Failed | Phase::TerminatingByTTL => Ok(()),
    };

    match step {
        Ok(()) => {
            ctx.failures.remove(&name);
            Ok(Action::requeue(requeue_after(&status, Utc::now())))
        }
        Err(e) => {
            let failures = {
                let mut entry = ctx.failures.entry(name.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if failures >= MAX_CONSECUTIVE_FAILURES {
                warn!(
                    action = "response_failed",
                    response = %name,
                    failures,
                    error = %e,
                    "giving up until ttl"
                );
                let failed = AttackResponseStatus {
                    phase: Phase::Failed,
                    message: Some(e.to_string()),
                    ..status
                };
                patch_status(&api, &name, &failed).await?;
                ctx.failures.remove(&name);
                Ok(Action::requeue(requeue_after(&failed, Utc::now())))
            } else {
                Err(e)
            }
        }
    }
}

pub fn error_policy(ar: Arc<AttackResponse>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    metrics::counter!("mirage_reconcile_errors_total").increment(1);
    warn!(
        action = "reconcile_error",
        response = %ar.name_any(),
        error = %error,
        "reconcile failed, backing off"
    );
    Action::requeue(RETRY_BACKOFF)
}

/// Drive Pending/Creating toward Active: three decoys (pod + service +
/// isolation policy each) in variant order, then program the gateway.
/// Re-entrant: decoys already recorded in status are not recreated, and
/// AlreadyExists from a half-applied earlier pass counts as created.
async fn ensure_fleet(
    ar: &AttackResponse,
    name: &str,
    ns: &str,
    mut status: AttackResponseStatus,
    ctx: &Ctx,
    api: &Api<AttackResponse>,
) -> Result<(), Error> {
    if status.phase == Phase::Pending {
        status.phase = Phase::Creating;
        status.message = Some("creating decoy fleet".to_string());
        patch_status(api, name, &status).await?;
    }

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), ns);
    let policies: Api<NetworkPolicy> = Api::namespaced(ctx.client.clone(), ns);

    let mut created_any = false;
    for variant in VARIANTS {
        let decoy = decoys::decoy_name(name, variant);
        if status.decoy_pods.iter().any(|p| p == &decoy) {
            continue;
        }
        if created_any {
            tokio::time::sleep(CREATE_STAGGER).await;
        }

        let pod = decoys::build_decoy_pod(ar, &ctx.cfg, variant, &decoy)?;
        let svc = decoys::build_decoy_service(ar, &ctx.cfg, variant, &decoy)?;
        let policy = decoys::build_decoy_network_policy(ar, &ctx.cfg, variant, &decoy)?;

        create_or_adopt(&pods, &pod).await?;
        create_or_adopt(&services, &svc).await?;
        create_or_adopt(&policies, &policy).await?;
        created_any = true;

        metrics::counter!("mirage_decoys_created_total", "variant" => variant.as_str()).increment(1);
        info!(
            action = "decoy_created",
            response = %name,
            decoy = %decoy,
            variant = variant.as_str(),
            "decoy staged"
        );

        status.decoy_pods.push(decoy.clone());
        status
            .decoy_urls
            .push(decoys::decoy_url(&decoy, ns, ctx.cfg.decoy_port));
        patch_status(api, name, &status).await?;
    }

    // Decoys all exist and are addressable: only now touch the gateway.
    ctx.manager
        .install_block(&ar.spec.source_ip, &status.decoy_urls)
        .await?;

    status.phase = Phase::Active;
    status.message = Some("fleet ready".to_string());
    patch_status(api, name, &status).await?;

    ctx.bus.emit(
        EventKind::FleetReady,
        json!({
            "response": name,
            "source_ip": ar.spec.source_ip,
            "decoy_urls": status.decoy_urls,
        }),
    );
    info!(
        action = "fleet_ready",
        response = %name,
        source_ip = %ar.spec.source_ip,
        decoys = status.decoy_pods.len(),
        "gateway programmed"
    );
    Ok(())
}

/// TTL teardown: mark, delete (owners cascade to the decoys and policies),
/// then clear the gateway entry. The gateway returns its defined
/// decoy-unreachable error inside the delete→clear window.
async fn teardown(
    api: &Api<AttackResponse>,
    ar: &AttackResponse,
    name: &str,
    ctx: &Ctx,
) -> Result<Action, Error> {
    let mut status = ar.status.clone().unwrap_or_default();
    status.phase = Phase::TerminatingByTTL;
    status.message = Some("ttl reached".to_string());
    if let Err(e) = patch_status(api, name, &status).await {
        // the delete below still proceeds
        warn!(action = "teardown_mark_failed", response = %name, error = %e, "could not mark terminating");
    }

    ctx.bus.emit(
        EventKind::Teardown,
        json!({
            "response": name,
            "source_ip": ar.spec.source_ip,
        }),
    );

    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    match ctx.manager.clear_block(&ar.spec.source_ip).await {
        Ok(removed) => {
            info!(
                action = "response_expired",
                response = %name,
                source_ip = %ar.spec.source_ip,
                gateway_entry_removed = removed,
                "attack response torn down"
            );
        }
        Err(e) => {
            // entry may already be gone or the gateway unreachable; the
            // gateway's decoy-unreachable handling covers a stale entry
            warn!(action = "clear_block_failed", response = %name, error = %e, "gateway clear failed");
        }
    }

    metrics::counter!("mirage_responses_expired_total").increment(1);
    Ok(Action::await_change())
}

async fn patch_status(
    api: &Api<AttackResponse>,
    name: &str,
    status: &AttackResponseStatus,
) -> Result<(), Error> {
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": status })),
    )
    .await?;
    Ok(())
}

async fn create_or_adopt<K>(api: &Api<K>, obj: &K) -> Result<(), Error>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Next reconcile: within a minute, or sooner when the TTL is close.
fn requeue_after(status: &AttackResponseStatus, now: chrono::DateTime<Utc>) -> Duration {
    match status.cleanup_due() {
        Some(due) => {
            let remaining = (due - now).num_seconds().max(0) as u64;
            Duration::from_secs(remaining.min(REQUEUE_CAP.as_secs()))
        }
        None => REQUEUE_CAP,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn status_due_in(secs: i64, now: chrono::DateTime<Utc>) -> AttackResponseStatus {
        AttackResponseStatus {
            cleanup_scheduled_at: Some(
                (now + chrono::Duration::seconds(secs)).to_rfc3339(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn requeue_clamps_to_one_minute() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        assert_eq!(
            requeue_after(&status_due_in(600, now), now),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn requeue_shrinks_near_deadline() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        assert_eq!(
            requeue_after(&status_due_in(25, now), now),
            Duration::from_secs(25)
        );
    }

    #[test]
    fn requeue_past_deadline_is_immediate() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        assert_eq!(
            requeue_after(&status_due_in(-5, now), now),
            Duration::ZERO
        );
    }

    #[test]
    fn requeue_without_schedule_uses_cap() {
        let now = Utc::now();
        assert_eq!(
            requeue_after(&AttackResponseStatus::default(), now),
            Duration::from_secs(60)
        );
    }
}
