// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM creation command.
//!
//! A creation runs in three phases:
//!
//! 1. [`VmCreator::prepare`] resolves the descriptor dialect and the
//!    initialization payload, runs the builder pipeline, and renders the
//!    request. Nothing leaves the process.
//! 2. [`VmCreator::dispatch`] sends the request to the host agent. This is
//!    the only blocking point and is never retried here.
//! 3. [`VmCreator::create`] ties the two together, then folds the host's
//!    answer into the VM's dynamic state unless the caller gave up on the
//!    creation in the meantime.

use std::sync::Arc;

use slog::{debug, error, info, o, warn, Logger};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use vmbroker_api_types::runtime::VmRuntimeSnapshot;
use vmbroker_api_types::CreateRequest;

use crate::agent::{create_request, AgentError, HostAgent};
use crate::compat::{
    resolve_dialect, FeatureMatrix, FeatureSupport, UnsupportedVersionError,
};
use crate::payload::{
    CloudInitGenerator, ConfigDriveCloudInit, PayloadGenerationError,
    PayloadResolver, SysprepGenerator, UnattendSysprep,
};
use crate::reconcile::reconcile;
use crate::spec::{self, BuildInput, Descriptor, InvalidSpecError};
use crate::vm::{CreateParams, VmDynamicState};

/// Reasons a creation can fail.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error(transparent)]
    UnsupportedVersion(#[from] UnsupportedVersionError),

    #[error("invalid VM definition: {0}")]
    InvalidSpec(#[from] InvalidSpecError),

    #[error(transparent)]
    PayloadGeneration(#[from] PayloadGenerationError),

    #[error("host communication failed: {0}")]
    HostCommunication(String),

    /// The host refused the request. `code` and `message` are the host's own.
    #[error("host rejected the request ({code}): {message}")]
    HostRejection { code: String, message: String },

    #[error("creation was cancelled before dispatch")]
    Cancelled,

    /// The host answered after the caller cancelled. The snapshot was not
    /// applied to the VM's dynamic state.
    #[error("creation was abandoned while in flight")]
    Abandoned(Box<VmRuntimeSnapshot>),
}

impl From<AgentError> for CreateError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Transport(msg) => CreateError::HostCommunication(msg),
            AgentError::Rejected { code, message } => {
                CreateError::HostRejection { code, message }
            }
        }
    }
}

pub type CreationResult = Result<VmRuntimeSnapshot, CreateError>;

/// The collaborators a [`VmCreator`] is built from.
pub struct Collaborators {
    pub features: Arc<dyn FeatureSupport>,
    pub sysprep: Arc<dyn SysprepGenerator>,
    pub cloud_init: Arc<dyn CloudInitGenerator>,
    pub agent: Arc<dyn HostAgent>,
}

impl Collaborators {
    /// The default feature matrix and payload generators, talking to `agent`.
    pub fn with_agent(agent: Arc<dyn HostAgent>) -> Self {
        Self {
            features: Arc::new(FeatureMatrix::default()),
            sysprep: Arc::new(UnattendSysprep),
            cloud_init: Arc::new(ConfigDriveCloudInit),
            agent,
        }
    }
}

/// Creates VMs on host agents.
///
/// A `VmCreator` holds no per-creation state, so any number of creations for
/// different VMs can run through one creator concurrently.
pub struct VmCreator {
    log: Logger,
    features: Arc<dyn FeatureSupport>,
    payloads: PayloadResolver,
    agent: Arc<dyn HostAgent>,
}

impl VmCreator {
    pub fn new(log: Logger, collaborators: Collaborators) -> Self {
        let Collaborators { features, sysprep, cloud_init, agent } =
            collaborators;
        Self {
            log,
            features,
            payloads: PayloadResolver::new(sysprep, cloud_init),
            agent,
        }
    }

    /// Builds the request that would create `params.vm` on `params.host`.
    pub fn prepare(
        &self,
        params: &CreateParams,
    ) -> Result<CreateRequest, CreateError> {
        let log = self.log.new(o!("vm_id" => params.vm.id.to_string()));

        let dialect =
            resolve_dialect(self.features.as_ref(), params.cluster_version)
                .map_err(|e| {
                    warn!(log, "cannot build descriptor"; "error" => %e);
                    e
                })?;
        info!(log, "resolved descriptor dialect";
              "dialect" => %dialect,
              "cluster_version" => %params.cluster_version);

        let payload = self
            .payloads
            .resolve(
                &params.initialization,
                &params.vm,
                params.supplied_payload.as_ref(),
            )
            .map_err(|e| {
                warn!(log, "payload generation failed"; "error" => ?e);
                e
            })?;
        match &payload {
            Some(p) => info!(log, "resolved initialization payload";
                             "media" => p.media.as_str(),
                             "files" => p.content.len(),
                             "origin" => ?p.origin),
            None => info!(log, "no initialization payload"),
        }

        let input =
            BuildInput::new(params, self.features.as_ref(), payload.as_ref());
        let spec = spec::build(&input, &log).map_err(|e| {
            warn!(log, "VM definition is invalid"; "error" => %e);
            e
        })?;

        let request = create_request(
            Descriptor::render(dialect, &spec),
            params.hibernation_volume_handle(),
        );
        if let Ok(json) = serde_json::to_string_pretty(&request) {
            info!(log, "built VM descriptor";
                  "devices" => spec.devices.len(),
                  "descriptor" => json);
        }

        Ok(request)
    }

    /// Sends `request` to the host agent and classifies the outcome.
    pub async fn dispatch(&self, request: &CreateRequest) -> CreationResult {
        let log = match request.vm_id() {
            Some(id) => self.log.new(o!("vm_id" => id.to_string())),
            None => self.log.clone(),
        };

        debug!(log, "dispatching create request");
        match self.agent.create(request).await {
            Ok(snapshot) => {
                info!(log, "host agent created VM";
                      "status" => ?snapshot.status);
                Ok(snapshot)
            }
            Err(e) => {
                match &e {
                    AgentError::Transport(_) => {
                        error!(log, "host agent unreachable"; "error" => %e);
                    }
                    AgentError::Rejected { .. } => {
                        warn!(log, "host agent rejected create"; "error" => %e);
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Creates `params.vm` and records the host's answer in `dynamic`.
    ///
    /// If `cancel` fires before the request is dispatched, no remote call is
    /// made. If it fires while the call is in flight, the call still runs to
    /// completion but its snapshot is handed back in
    /// [`CreateError::Abandoned`] instead of being applied. `dynamic` is only
    /// modified on success.
    pub async fn create(
        &self,
        params: &CreateParams,
        dynamic: &mut VmDynamicState,
        cancel: &CancellationToken,
    ) -> CreationResult {
        let log = self.log.new(o!("vm_id" => params.vm.id.to_string()));
        let request = self.prepare(params)?;

        if cancel.is_cancelled() {
            info!(log, "creation cancelled before dispatch");
            return Err(CreateError::Cancelled);
        }

        let snapshot = self.dispatch(&request).await?;
        if snapshot.vm_id != params.vm.id {
            let msg = format!(
                "host answered for VM {} instead of {}",
                snapshot.vm_id, params.vm.id
            );
            error!(log, "unexpected create response"; "error" => %msg);
            return Err(CreateError::HostCommunication(msg));
        }

        if cancel.is_cancelled() {
            warn!(log, "creation abandoned in flight, not reconciling";
                  "status" => ?snapshot.status);
            return Err(CreateError::Abandoned(Box::new(snapshot)));
        }

        reconcile(dynamic, &snapshot);
        dynamic.run_on_host = Some(params.host.id);
        debug!(log, "reconciled dynamic state";
               "status" => ?dynamic.status,
               "host" => %params.host.id);

        Ok(snapshot)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Barrier;
    use uuid::Uuid;
    use vmbroker_api_types::runtime::{CpuCounters, VmStatus};
    use vmbroker_api_types::ClusterVersion;

    use crate::vm::{CpuTopology, TargetHost, VmSpec};

    enum Behavior {
        Answer,
        Fail(AgentError),
        Rendezvous(Barrier),
        CancelInFlight(CancellationToken),
    }

    struct TestAgent {
        behavior: Behavior,
        calls: Mutex<Vec<CreateRequest>>,
    }

    impl TestAgent {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self { behavior, calls: Mutex::new(Vec::new()) })
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HostAgent for TestAgent {
        async fn create(
            &self,
            request: &CreateRequest,
        ) -> Result<VmRuntimeSnapshot, AgentError> {
            self.calls.lock().unwrap().push(request.clone());
            match &self.behavior {
                Behavior::Answer => {}
                Behavior::Fail(e) => return Err(e.clone()),
                Behavior::Rendezvous(barrier) => {
                    barrier.wait().await;
                }
                Behavior::CancelInFlight(token) => token.cancel(),
            }

            Ok(VmRuntimeSnapshot {
                cpu: Some(CpuCounters {
                    vcpu_count: 2,
                    user_pct: 0.0,
                    sys_pct: 0.0,
                }),
                ..VmRuntimeSnapshot::bare(
                    request.vm_id().unwrap(),
                    VmStatus::WaitForLaunch,
                )
            })
        }
    }

    fn creator(agent: Arc<TestAgent>) -> VmCreator {
        VmCreator::new(
            Logger::root(slog::Discard, o!()),
            Collaborators::with_agent(agent),
        )
    }

    fn params(vm_id: u128) -> CreateParams {
        CreateParams::new(
            VmSpec::new(
                Uuid::from_u128(vm_id),
                "vm",
                CpuTopology::new(1, 2, 1),
            ),
            TargetHost {
                id: Uuid::from_u128(0x4057),
                name: "host-1".to_string(),
                cpu_threads: 8,
                display_address: None,
            },
            ClusterVersion::new(4, 7),
        )
    }

    #[tokio::test]
    async fn successful_creation_reconciles() {
        let agent = TestAgent::new(Behavior::Answer);
        let creator = creator(agent.clone());
        let params = params(1);
        let mut dynamic = VmDynamicState::new(params.vm.id);

        let snapshot = creator
            .create(&params, &mut dynamic, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(snapshot.status, VmStatus::WaitForLaunch);
        assert_eq!(dynamic.status, VmStatus::WaitForLaunch);
        assert_eq!(dynamic.vcpu_count, Some(2));
        assert_eq!(dynamic.run_on_host, Some(params.host.id));
        assert_eq!(agent.calls(), 1);
    }

    #[tokio::test]
    async fn unsupported_version_never_dispatches() {
        let agent = TestAgent::new(Behavior::Answer);
        let creator = creator(agent.clone());
        let mut params = params(1);
        params.cluster_version = ClusterVersion::new(3, 6);
        let mut dynamic = VmDynamicState::new(params.vm.id);

        let err = creator
            .create(&params, &mut dynamic, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CreateError::UnsupportedVersion(_)));
        assert_eq!(agent.calls(), 0);
        assert_eq!(dynamic, VmDynamicState::new(params.vm.id));
    }

    #[tokio::test]
    async fn rejection_is_forwarded_verbatim() {
        let agent = TestAgent::new(Behavior::Fail(AgentError::Rejected {
            code: "InsufficientResources".to_string(),
            message: "not enough memory: 4096 MiB requested".to_string(),
        }));
        let creator = creator(agent);
        let params = params(1);
        let mut dynamic = VmDynamicState::new(params.vm.id);

        let err = creator
            .create(&params, &mut dynamic, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            CreateError::HostRejection { code, message } => {
                assert_eq!(code, "InsufficientResources");
                assert_eq!(message, "not enough memory: 4096 MiB requested");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(dynamic, VmDynamicState::new(params.vm.id));
    }

    #[tokio::test]
    async fn cancelled_before_dispatch() {
        let agent = TestAgent::new(Behavior::Answer);
        let creator = creator(agent.clone());
        let params = params(1);
        let mut dynamic = VmDynamicState::new(params.vm.id);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err =
            creator.create(&params, &mut dynamic, &cancel).await.unwrap_err();
        assert!(matches!(err, CreateError::Cancelled));
        assert_eq!(agent.calls(), 0);
        assert_eq!(dynamic, VmDynamicState::new(params.vm.id));
    }

    #[tokio::test]
    async fn abandoned_in_flight_is_not_reconciled() {
        let cancel = CancellationToken::new();
        let agent = TestAgent::new(Behavior::CancelInFlight(cancel.clone()));
        let creator = creator(agent.clone());
        let params = params(1);
        let mut dynamic = VmDynamicState::new(params.vm.id);

        let err =
            creator.create(&params, &mut dynamic, &cancel).await.unwrap_err();
        let CreateError::Abandoned(snapshot) = err else {
            panic!("expected an abandoned creation, got {err:?}");
        };
        assert_eq!(snapshot.vm_id, params.vm.id);
        assert_eq!(agent.calls(), 1);
        assert_eq!(dynamic, VmDynamicState::new(params.vm.id));
    }

    #[tokio::test]
    async fn answer_for_another_vm_is_a_communication_error() {
        struct Confused;

        #[async_trait]
        impl HostAgent for Confused {
            async fn create(
                &self,
                _request: &CreateRequest,
            ) -> Result<VmRuntimeSnapshot, AgentError> {
                Ok(VmRuntimeSnapshot::bare(Uuid::from_u128(99), VmStatus::Up))
            }
        }

        let creator = VmCreator::new(
            Logger::root(slog::Discard, o!()),
            Collaborators::with_agent(Arc::new(Confused)),
        );
        let params = params(1);
        let mut dynamic = VmDynamicState::new(params.vm.id);

        let err = creator
            .create(&params, &mut dynamic, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CreateError::HostCommunication(_)));
        assert_eq!(dynamic, VmDynamicState::new(params.vm.id));
    }

    #[tokio::test]
    async fn creations_for_different_vms_run_concurrently() {
        // Each call waits until both calls are in flight, so this only
        // finishes if the creator lets them overlap.
        let agent = TestAgent::new(Behavior::Rendezvous(Barrier::new(2)));
        let creator = creator(agent.clone());
        let (a, b) = (params(1), params(2));
        let mut state_a = VmDynamicState::new(a.vm.id);
        let mut state_b = VmDynamicState::new(b.vm.id);
        let cancel = CancellationToken::new();

        let both = async {
            tokio::join!(
                creator.create(&a, &mut state_a, &cancel),
                creator.create(&b, &mut state_b, &cancel),
            )
        };
        let (ra, rb) = tokio::time::timeout(Duration::from_secs(10), both)
            .await
            .expect("creations serialized");
        ra.unwrap();
        rb.unwrap();
        assert_eq!(agent.calls(), 2);
        assert_eq!(state_a.run_on_host, state_b.run_on_host);
    }
}
