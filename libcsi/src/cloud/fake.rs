//! In-memory [`CloudVolumes`] implementation.
//!
//! Behaves like the real API where the driver can observe it: names are
//! unique, attach/detach/create/delete return actions that stay `running`
//! for a configurable number of polls, and unknown ids are `NotFound`.
//! Every mutating call is counted so tests can assert how many remote
//! operations an RPC sequence issued, and failures can be injected per
//! operation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    Action, ActionResource, ActionStatus, CloudError, CloudVolume, CloudVolumes, CreateVolumeOpts,
    CreatedVolume, Server,
};
use crate::types::{NodeId, VolumeId};

/// Operation selector for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOp {
    Create,
    Get,
    List,
    Delete,
    Attach,
    Detach,
    GetAction,
    GetServer,
}

/// Number of remote calls issued, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FakeCalls {
    pub create: usize,
    pub delete: usize,
    pub attach: usize,
    pub detach: usize,
    pub get_action: usize,
}

#[derive(Debug)]
struct FakeAction {
    action: Action,
    remaining_polls: u32,
    outcome: ActionStatus,
}

#[derive(Debug, Default)]
struct State {
    volumes: BTreeMap<u64, CloudVolume>,
    servers: BTreeMap<u64, Server>,
    actions: HashMap<u64, FakeAction>,
    next_id: u64,
    action_polls: u32,
    failing_action: Option<String>,
    injected: VecDeque<(FakeOp, CloudError)>,
    calls: FakeCalls,
}

impl State {
    fn take_failure(&mut self, op: FakeOp) -> Result<(), CloudError> {
        let idx = self.injected.iter().position(|(o, _)| *o == op);
        match idx.and_then(|idx| self.injected.remove(idx)) {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn start_action(&mut self, command: &str, kind: &str, resource: u64) -> Action {
        let id = self.next_id();
        let outcome = if self.failing_action.is_some() {
            ActionStatus::Error
        } else {
            ActionStatus::Success
        };
        let action = Action {
            id,
            command: command.to_owned(),
            status: ActionStatus::Running,
            resources: vec![ActionResource {
                id: resource.to_string(),
                kind: kind.to_owned(),
            }],
            error: self.failing_action.take(),
        };
        self.actions.insert(
            id,
            FakeAction {
                action: action.clone(),
                remaining_polls: self.action_polls,
                outcome,
            },
        );
        action
    }

    fn volume_mut(&mut self, id: &VolumeId) -> Result<&mut CloudVolume, CloudError> {
        id.0.parse::<u64>()
            .ok()
            .and_then(|n| self.volumes.get_mut(&n))
            .ok_or_else(|| CloudError::NotFound(format!("volume {id}")))
    }
}

/// Stateful fake of the cloud volume API.
#[derive(Debug, Default)]
pub struct FakeCloud {
    state: Mutex<State>,
}

impl FakeCloud {
    /// A fake with one known server.
    pub fn with_server(server: impl Into<NodeId>, location: &str) -> Self {
        let fake = Self::default();
        fake.add_server(server, location);
        fake
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned fake only happens after a test already panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_server(&self, server: impl Into<NodeId>, location: &str) {
        let id: NodeId = server.into();
        if let Ok(n) = id.0.parse::<u64>() {
            self.lock().servers.insert(
                n,
                Server {
                    name: format!("server-{n}"),
                    id,
                    location: location.to_owned(),
                },
            );
        }
    }

    /// Actions report `running` this many times before finishing.
    pub fn set_action_polls(&self, polls: u32) {
        self.lock().action_polls = polls;
    }

    /// The next action started finishes with `error` and this code.
    pub fn fail_next_action(&self, code: &str) {
        self.lock().failing_action = Some(code.to_owned());
    }

    /// The next call of `op` fails with `err`.
    pub fn fail_next(&self, op: FakeOp, err: CloudError) {
        self.lock().injected.push_back((op, err));
    }

    /// Attach a volume behind the driver's back, as another controller would.
    pub fn force_attach(&self, volume: &VolumeId, server: impl Into<NodeId>) {
        if let Ok(vol) = self.lock().volume_mut(volume) {
            vol.server = Some(server.into());
        }
    }

    pub fn calls(&self) -> FakeCalls {
        self.lock().calls
    }

    pub fn volumes(&self) -> Vec<CloudVolume> {
        self.lock().volumes.values().cloned().collect()
    }

    pub fn volume(&self, id: &VolumeId) -> Option<CloudVolume> {
        self.lock().volume_mut(id).ok().cloned()
    }
}

#[async_trait]
impl CloudVolumes for FakeCloud {
    async fn create_volume(&self, opts: CreateVolumeOpts) -> Result<CreatedVolume, CloudError> {
        let mut state = self.lock();
        state.calls.create += 1;
        state.take_failure(FakeOp::Create)?;
        if state.volumes.values().any(|v| v.name == opts.name) {
            return Err(CloudError::AlreadyExists(format!(
                "volume name {} is already used",
                opts.name
            )));
        }
        let id = state.next_id();
        let volume = CloudVolume {
            id: VolumeId(id.to_string()),
            name: opts.name,
            size_bytes: opts.size_bytes,
            created_at: Utc::now(),
            location: opts.location,
            server: None,
            linux_device: Some(format!("/dev/disk/by-id/scsi-0HC_Volume_{id}")),
        };
        state.volumes.insert(id, volume.clone());
        let action = state.start_action("create_volume", "volume", id);
        Ok(CreatedVolume {
            volume,
            action: Some(action),
        })
    }

    async fn get_volume(&self, id: &VolumeId) -> Result<CloudVolume, CloudError> {
        let mut state = self.lock();
        state.take_failure(FakeOp::Get)?;
        state.volume_mut(id).map(|v| v.clone())
    }

    async fn list_volumes(&self, name: Option<&str>) -> Result<Vec<CloudVolume>, CloudError> {
        let mut state = self.lock();
        state.take_failure(FakeOp::List)?;
        Ok(state
            .volumes
            .values()
            .filter(|v| name.is_none_or(|n| v.name == n))
            .cloned()
            .collect())
    }

    async fn delete_volume(&self, id: &VolumeId) -> Result<Option<Action>, CloudError> {
        let mut state = self.lock();
        state.calls.delete += 1;
        state.take_failure(FakeOp::Delete)?;
        let vol = state.volume_mut(id)?;
        if vol.server.is_some() {
            return Err(CloudError::Locked(format!("volume {id} is attached")));
        }
        let n = id.0.parse::<u64>().unwrap_or_default();
        state.volumes.remove(&n);
        Ok(Some(state.start_action("delete_volume", "volume", n)))
    }

    async fn attach_volume(&self, id: &VolumeId, server: &NodeId) -> Result<Action, CloudError> {
        let mut state = self.lock();
        state.calls.attach += 1;
        state.take_failure(FakeOp::Attach)?;
        let known_server = server
            .0
            .parse::<u64>()
            .is_ok_and(|n| state.servers.contains_key(&n));
        if !known_server {
            return Err(CloudError::NotFound(format!("server {server}")));
        }
        let vol = state.volume_mut(id)?;
        if vol.server.is_some() {
            return Err(CloudError::Locked(format!("volume {id} is already attached")));
        }
        vol.server = Some(server.clone());
        let n = id.0.parse::<u64>().unwrap_or_default();
        Ok(state.start_action("attach_volume", "volume", n))
    }

    async fn detach_volume(&self, id: &VolumeId) -> Result<Action, CloudError> {
        let mut state = self.lock();
        state.calls.detach += 1;
        state.take_failure(FakeOp::Detach)?;
        let vol = state.volume_mut(id)?;
        if vol.server.take().is_none() {
            return Err(CloudError::Unknown {
                code: "not_attached".into(),
                message: format!("volume {id} is not attached"),
            });
        }
        let n = id.0.parse::<u64>().unwrap_or_default();
        Ok(state.start_action("detach_volume", "volume", n))
    }

    async fn get_action(&self, id: u64) -> Result<Action, CloudError> {
        let mut state = self.lock();
        state.calls.get_action += 1;
        state.take_failure(FakeOp::GetAction)?;
        let entry = state
            .actions
            .get_mut(&id)
            .ok_or_else(|| CloudError::NotFound(format!("action {id}")))?;
        if entry.remaining_polls > 0 {
            entry.remaining_polls -= 1;
        } else {
            entry.action.status = entry.outcome;
        }
        Ok(entry.action.clone())
    }

    async fn get_server(&self, id: &NodeId) -> Result<Server, CloudError> {
        let mut state = self.lock();
        state.take_failure(FakeOp::GetServer)?;
        id.0.parse::<u64>()
            .ok()
            .and_then(|n| state.servers.get(&n).cloned())
            .ok_or_else(|| CloudError::NotFound(format!("server {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(name: &str) -> CreateVolumeOpts {
        CreateVolumeOpts {
            name: name.into(),
            size_bytes: 1 << 30,
            location: "fsn1".into(),
        }
    }

    #[tokio::test]
    async fn names_are_unique() {
        let cloud = FakeCloud::default();
        cloud.create_volume(opts("a")).await.unwrap();
        let err = cloud.create_volume(opts("a")).await.unwrap_err();
        assert!(matches!(err, CloudError::AlreadyExists(_)));
        assert_eq!(cloud.list_volumes(Some("a")).await.unwrap().len(), 1);
        assert_eq!(cloud.calls().create, 2);
    }

    #[tokio::test]
    async fn actions_run_for_configured_polls() {
        let cloud = FakeCloud::default();
        cloud.set_action_polls(2);
        let created = cloud.create_volume(opts("a")).await.unwrap();
        let id = created.action.unwrap().id;
        assert_eq!(cloud.get_action(id).await.unwrap().status, ActionStatus::Running);
        assert_eq!(cloud.get_action(id).await.unwrap().status, ActionStatus::Running);
        assert_eq!(cloud.get_action(id).await.unwrap().status, ActionStatus::Success);
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let cloud = FakeCloud::default();
        cloud.fail_next(FakeOp::List, CloudError::RateLimited("slow".into()));
        assert!(cloud.list_volumes(None).await.is_err());
        assert!(cloud.list_volumes(None).await.is_ok());
    }

    #[tokio::test]
    async fn attach_requires_known_server_and_free_volume() {
        let cloud = FakeCloud::with_server("1", "fsn1");
        cloud.add_server("2", "fsn1");
        let vol = cloud.create_volume(opts("a")).await.unwrap().volume;

        let err = cloud.attach_volume(&vol.id, &"9".into()).await.unwrap_err();
        assert!(matches!(err, CloudError::NotFound(_)));

        cloud.attach_volume(&vol.id, &"1".into()).await.unwrap();
        let err = cloud.attach_volume(&vol.id, &"2".into()).await.unwrap_err();
        assert!(matches!(err, CloudError::Locked(_)));
        assert_eq!(cloud.volume(&vol.id).unwrap().server, Some(NodeId::from("1")));
    }
}
