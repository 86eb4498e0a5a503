//! Worker workload templates and the Kubernetes calls that manage them.
//!
//! Workers run as batch Jobs with `restartPolicy: Never`: a session that
//! takes the self-exit fast path completes its Job and is never restarted
//! in place, which a Deployment cannot express (its pods are pinned to
//! `restartPolicy: Always`). "Scale to one" therefore means create a
//! runnable Job (replacing a finished one), and "scale to zero" means
//! delete it.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use tracing::info;

use crate::config::Config;
use crate::types::{user_queue_name, worker_deployment_name, InboundMessage};

const MANAGED_BY: &str = "codeagent-server";
const LAST_MESSAGE_ANNOTATION: &str = "codeagent.io/last-message-at";
/// Finished Jobs are swept by the TTL controller; activation replaces them
/// sooner if a new message arrives first.
const FINISHED_JOB_TTL_SECONDS: i32 = 600;
/// Pod crashes tolerated by the Job controller before the workload counts
/// as failed. Clean idle exits complete the Job and are never retried.
const POD_FAILURE_BACKOFF_LIMIT: i32 = 2;

const DELETION_POLL: Duration = Duration::from_millis(500);
const DELETION_POLL_ROUNDS: u32 = 10;

/// Kubernetes surface of the orchestrator. One instance per namespace.
pub struct WorkloadManager {
    api: Api<Job>,
}

impl WorkloadManager {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    /// Bring the user's worker up: create its Job, replace a finished one,
    /// or refresh the activity annotation on a live one.
    ///
    /// Job specs are immutable, so a finished Job (the worker self-exited
    /// on idle) is deleted and recreated. The replacement never carries the
    /// `INITIAL_*` bootstrap again; messages reach the fresh session over
    /// its queue.
    pub async fn activate(
        &self,
        config: &Config,
        user_id: &str,
        bootstrap: Option<&InboundMessage>,
    ) -> Result<()> {
        let name = worker_deployment_name(user_id);
        let existing = self
            .api
            .get_opt(&name)
            .await
            .with_context(|| format!("failed to read job {name}"))?;

        match existing {
            None => self.create(config, user_id, bootstrap).await,
            Some(job) if job_finished(&job) => {
                info!(job = %name, "replacing finished worker job");
                self.delete(&name).await?;
                self.await_deletion(&name).await?;
                self.create(config, user_id, None).await
            }
            Some(_) => self.touch(&name).await,
        }
    }

    async fn create(
        &self,
        config: &Config,
        user_id: &str,
        bootstrap: Option<&InboundMessage>,
    ) -> Result<()> {
        let name = worker_deployment_name(user_id);
        let job = worker_template(config, user_id, bootstrap, Utc::now());

        match self.api.create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!(job = %name, "worker job created");
                Ok(())
            }
            // Lost a benign create race; the winner is equivalent.
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to create job {name}")),
        }
    }

    /// Refresh the activity annotation on a live workload.
    async fn touch(&self, name: &str) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": { LAST_MESSAGE_ANNOTATION: Utc::now().to_rfc3339() }
            }
        });

        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("failed to annotate job {name}"))?;
        Ok(())
    }

    async fn await_deletion(&self, name: &str) -> Result<()> {
        for _ in 0..DELETION_POLL_ROUNDS {
            if self.api.get_opt(name).await?.is_none() {
                return Ok(());
            }
            tokio::time::sleep(DELETION_POLL).await;
        }
        bail!("previous worker job {name} is still terminating")
    }

    /// Ready pod count as reported by the workload.
    pub async fn ready_pods(&self, user_id: &str) -> Result<i32> {
        let name = worker_deployment_name(user_id);
        let job = self
            .api
            .get_opt(&name)
            .await
            .with_context(|| format!("failed to read job {name}"))?;
        Ok(job
            .and_then(|j| j.status)
            .map(|s| s.ready.or(s.active).unwrap_or(0))
            .unwrap_or(0))
    }

    /// Scale-to-zero: delete the Job and its pod.
    pub async fn deactivate(&self, user_id: &str) -> Result<()> {
        self.delete(&worker_deployment_name(user_id)).await
    }

    /// Delete a worker job outright (admin action, orphan GC, replacement).
    /// Absence counts as success.
    pub async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(job = %name, "worker job deleted");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete job {name}")),
        }
    }

    /// All workloads this orchestrator manages, with each one's last
    /// recorded activity.
    pub async fn list_managed(&self) -> Result<Vec<ManagedWorkload>> {
        let params =
            ListParams::default().labels(&format!("app.kubernetes.io/managed-by={MANAGED_BY}"));
        let list = self
            .api
            .list(&params)
            .await
            .context("failed to list worker jobs")?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|job| {
                let name = job.metadata.name.clone()?;
                let last_message_at = job
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(LAST_MESSAGE_ANNOTATION))
                    .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                    .map(|v| v.with_timezone(&Utc));
                let user_id = job
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get("codeagent.io/user-id"))
                    .cloned();
                Some(ManagedWorkload {
                    name,
                    user_id,
                    last_message_at,
                })
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct ManagedWorkload {
    pub name: String,
    pub user_id: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// A Job that has run to completion or exhausted its pod failures. Either
/// way it will never run another pod and must be replaced to serve again.
fn job_finished(job: &Job) -> bool {
    let Some(status) = &job.status else {
        return false;
    };
    if status.completion_time.is_some() {
        return true;
    }
    status
        .conditions
        .as_ref()
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True")
        })
        .unwrap_or(false)
}

/// Render the worker Job for a user.
///
/// One container, the bus connection and session identity in env, agent and
/// chat credentials injected from the orchestrator-managed secret, a 10Gi
/// scratch volume for the workspace, tolerations for preemptible nodes, and
/// `restartPolicy: Never` so a worker that self-exits on idle stays exited.
fn worker_template(
    config: &Config,
    user_id: &str,
    bootstrap: Option<&InboundMessage>,
    now: DateTime<Utc>,
) -> Job {
    let name = worker_deployment_name(user_id);

    let mut env = vec![
        env_var("USER_ID", user_id),
        env_var("DEPLOYMENT_NAME", &name),
        env_var("DATABASE_URL", &config.database_url),
        env_var(
            "SESSION_TIMEOUT_MINUTES",
            &config.session_timeout_minutes.to_string(),
        ),
        env_var("WORKER_QUEUE", &user_queue_name(user_id)),
    ];
    if let Some(slug) = config.repo_for_user(user_id) {
        env.push(env_var(
            "REPOSITORY_URL",
            &format!("https://github.com/{slug}.git"),
        ));
    }
    if let Some(message) = bootstrap {
        env.push(env_var("INITIAL_MESSAGE_TEXT", &message.message_text));
        env.push(env_var("INITIAL_CHANNEL_ID", &message.channel_id));
        env.push(env_var("INITIAL_THREAD_ID", &message.thread_id));
        env.push(env_var("INITIAL_MESSAGE_ID", &message.message_id));
        env.push(env_var(
            "INITIAL_ORIGINAL_MESSAGE_TS",
            &message.original_message_ts,
        ));
        env.push(env_var("INITIAL_PLACEHOLDER_TS", &message.placeholder_ts));
    }

    let env_from = config
        .worker_secret_name
        .as_ref()
        .map(|secret| serde_json::json!([{ "secretRef": { "name": secret } }]))
        .unwrap_or_else(|| serde_json::json!([]));

    let value = serde_json::json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": name,
            "labels": {
                "app.kubernetes.io/managed-by": MANAGED_BY,
                "codeagent.io/user-id": crate::types::sanitize_id(user_id),
            },
            "annotations": {
                LAST_MESSAGE_ANNOTATION: now.to_rfc3339(),
            }
        },
        "spec": {
            "parallelism": 1,
            "completions": 1,
            "backoffLimit": POD_FAILURE_BACKOFF_LIMIT,
            "ttlSecondsAfterFinished": FINISHED_JOB_TTL_SECONDS,
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "worker",
                        "image": config.worker_image,
                        "env": env,
                        "envFrom": env_from,
                        "volumeMounts": [{
                            "name": "workspace",
                            "mountPath": "/workspace"
                        }],
                    }],
                    "volumes": [{
                        "name": "workspace",
                        "emptyDir": { "sizeLimit": "10Gi" }
                    }],
                    "tolerations": [{
                        "key": "node.kubernetes.io/preemptible",
                        "operator": "Exists",
                        "effect": "NoSchedule"
                    }],
                }
            }
        }
    });

    // The literal above is a valid Job by construction.
    serde_json::from_value(value).unwrap_or_default()
}

fn env_var(name: &str, value: &str) -> serde_json::Value {
    serde_json::json!({ "name": name, "value": value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn sample_config() -> Config {
        Config {
            database_url: "postgres://bus/jobs".into(),
            port: 8080,
            slack_bot_token: "xoxb".into(),
            slack_signing_secret: "secret".into(),
            allowed_users: Vec::new(),
            rate_limit_enabled: true,
            rate_limit_max: 5,
            rate_limit_window: Duration::from_secs(900),
            grace_period: Duration::from_secs(300),
            worker_namespace: "default".into(),
            worker_image: "registry.local/worker:1".into(),
            worker_secret_name: Some("worker-credentials".into()),
            session_timeout_minutes: 30,
            user_repos: HashMap::from([("U1".to_string(), "acme/api".to_string())]),
        }
    }

    #[test]
    fn template_never_restarts_completed_workers() {
        let config = sample_config();
        let job = worker_template(&config, "U1", None, Utc::now());

        let spec = job.spec.unwrap();
        assert_eq!(spec.parallelism, Some(1));
        assert_eq!(spec.completions, Some(1));
        assert_eq!(spec.backoff_limit, Some(POD_FAILURE_BACKOFF_LIMIT));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn template_carries_identity_and_bus_env() {
        let config = sample_config();
        let job = worker_template(&config, "U1", None, Utc::now());

        assert_eq!(job.metadata.name.as_deref(), Some("worker-u1"));

        let spec = job.spec.unwrap();
        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        let env = container.env.as_ref().unwrap();

        let get = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.clone())
        };
        assert_eq!(get("USER_ID").as_deref(), Some("U1"));
        assert_eq!(get("DEPLOYMENT_NAME").as_deref(), Some("worker-u1"));
        assert_eq!(get("DATABASE_URL").as_deref(), Some("postgres://bus/jobs"));
        assert_eq!(get("WORKER_QUEUE").as_deref(), Some("user_u1_queue"));
        assert_eq!(
            get("REPOSITORY_URL").as_deref(),
            Some("https://github.com/acme/api.git")
        );

        let env_from = serde_json::to_value(container.env_from.as_ref().unwrap()).unwrap();
        assert_eq!(env_from[0]["secretRef"]["name"], "worker-credentials");
    }

    #[test]
    fn template_embeds_bootstrap_message_only_when_given() {
        let config = sample_config();
        let message = InboundMessage {
            user_id: "U1".into(),
            thread_id: "T1".into(),
            channel_id: "C1".into(),
            message_id: "M1".into(),
            message_text: "hello".into(),
            original_message_ts: "M1".into(),
            placeholder_ts: "P1".into(),
            platform_metadata: serde_json::Value::Null,
            agent_options: Default::default(),
        };

        let with = worker_template(&config, "U1", Some(&message), Utc::now());
        let env = serde_json::to_value(&with).unwrap();
        let env = env["spec"]["template"]["spec"]["containers"][0]["env"]
            .as_array()
            .unwrap()
            .clone();
        assert!(env
            .iter()
            .any(|e| e["name"] == "INITIAL_MESSAGE_TEXT" && e["value"] == "hello"));
        assert!(env
            .iter()
            .any(|e| e["name"] == "INITIAL_PLACEHOLDER_TS" && e["value"] == "P1"));

        // A replacement activation passes no bootstrap and must not carry
        // any INITIAL_* leftovers.
        let without = worker_template(&config, "U1", None, Utc::now());
        let env = serde_json::to_value(&without).unwrap();
        let env = env["spec"]["template"]["spec"]["containers"][0]["env"]
            .as_array()
            .unwrap()
            .clone();
        assert!(env
            .iter()
            .all(|e| !e["name"].as_str().unwrap_or_default().starts_with("INITIAL_")));
    }

    #[test]
    fn template_mounts_scratch_volume_and_tolerates_preemption() {
        let config = sample_config();
        let job = worker_template(&config, "U2", None, Utc::now());

        let spec = job.spec.unwrap();
        let pod = spec.template.spec.unwrap();

        let volume = &pod.volumes.as_ref().unwrap()[0];
        assert_eq!(volume.name, "workspace");
        assert_eq!(
            volume
                .empty_dir
                .as_ref()
                .unwrap()
                .size_limit
                .as_ref()
                .unwrap()
                .0,
            "10Gi"
        );

        let toleration = &pod.tolerations.as_ref().unwrap()[0];
        assert_eq!(
            toleration.key.as_deref(),
            Some("node.kubernetes.io/preemptible")
        );
    }

    #[test]
    fn job_without_status_is_not_finished() {
        let job: Job = serde_json::from_value(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "worker-u1" }
        }))
        .unwrap();
        assert!(!job_finished(&job));
    }

    #[test]
    fn completed_and_failed_jobs_are_finished() {
        let completed: Job = serde_json::from_value(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "worker-u1" },
            "status": { "completionTime": "2026-08-01T10:00:00Z", "succeeded": 1 }
        }))
        .unwrap();
        assert!(job_finished(&completed));

        let failed: Job = serde_json::from_value(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "worker-u1" },
            "status": {
                "conditions": [{ "type": "Failed", "status": "True" }]
            }
        }))
        .unwrap();
        assert!(job_finished(&failed));
    }

    #[test]
    fn running_job_is_not_finished() {
        let running: Job = serde_json::from_value(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "worker-u1" },
            "status": { "active": 1, "ready": 1 }
        }))
        .unwrap();
        assert!(!job_finished(&running));
    }
}
