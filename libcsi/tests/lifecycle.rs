//! Volume lifecycle integration tests
//!
//! These tests drive the whole plugin through its socket: client → unix
//! socket → CsiServer → Driver → fake cloud and fake mounter.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use libcsi::backend::{ControllerService, Driver, NodeService};
use libcsi::cloud::CloudVolumes;
use libcsi::cloud::fake::FakeCloud;
use libcsi::config::DriverConfig;
use libcsi::error::Code;
use libcsi::mount::Mounter;
use libcsi::mount::fake::FakeMounter;
use libcsi::transport::{CsiClient, CsiServer};
use libcsi::*;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const NODE: &str = "1";
const STAGING: &str = "/mnt/stage";
const TARGET: &str = "/mnt/target";

/// A plugin with both services serving on a socket in a temporary directory.
struct Plugin {
    client: CsiClient,
    cloud: Arc<FakeCloud>,
    mounter: Arc<FakeMounter>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    _dir: TempDir,
}

impl Plugin {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(FakeCloud::with_server(NODE, "fsn1"));
        cloud.add_server("2", "fsn1");
        cloud.set_action_polls(1);
        let mounter = Arc::new(FakeMounter::default());
        let config = DriverConfig::fast(NODE);

        let driver = Driver::new()
            .with_controller(ControllerService::new(
                Arc::clone(&cloud) as Arc<dyn CloudVolumes>,
                config.clone(),
            ))
            .with_node(NodeService::new(
                Arc::clone(&mounter) as Arc<dyn Mounter>,
                &config,
            ));

        let socket = dir.path().join("csi.sock");
        let server = CsiServer::bind(&socket, Arc::new(driver), config.request_timeout)
            .await
            .unwrap();
        let (shutdown, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            server
                .serve_with_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            client: CsiClient::new(socket),
            cloud,
            mounter,
            shutdown,
            handle,
            _dir: dir,
        }
    }

    async fn call(&self, msg: CsiMessage) -> Result<CsiMessage, CsiError> {
        self.client
            .call_with_timeout(msg, Duration::from_secs(5))
            .await
    }

    async fn create(&self, name: &str, gib: u64) -> Volume {
        let req = CreateVolumeRequest {
            name: name.into(),
            capacity_range: CapacityRange::gib(gib),
            volume_capabilities: vec![VolumeCapability::mount("ext4")],
            parameters: HashMap::new(),
        };
        match self.call(CsiMessage::CreateVolume(req)).await.unwrap() {
            CsiMessage::VolumeCreated(vol) => vol,
            other => panic!("unexpected response {other}"),
        }
    }

    async fn attach(&self, volume_id: &VolumeId, node: &str) -> Result<HashMap<String, String>, CsiError> {
        let req = ControllerPublishVolumeRequest {
            volume_id: volume_id.clone(),
            node_id: node.into(),
            volume_capability: VolumeCapability::mount("ext4"),
            readonly: false,
        };
        match self.call(CsiMessage::ControllerPublishVolume(req)).await? {
            CsiMessage::VolumePublished(ctx) => Ok(ctx),
            other => panic!("unexpected response {other}"),
        }
    }

    async fn close(self) {
        self.shutdown.send(()).unwrap();
        self.handle.await.unwrap();
    }
}

fn stage_msg(volume_id: &VolumeId, ctx: &HashMap<String, String>) -> CsiMessage {
    CsiMessage::StageVolume(NodeStageVolumeRequest {
        volume_id: volume_id.clone(),
        publish_context: ctx.clone(),
        staging_target_path: STAGING.into(),
        volume_capability: VolumeCapability::mount("ext4"),
        volume_context: HashMap::new(),
    })
}

fn publish_msg(volume_id: &VolumeId, ctx: &HashMap<String, String>) -> CsiMessage {
    CsiMessage::PublishVolume(NodePublishVolumeRequest {
        volume_id: volume_id.clone(),
        publish_context: ctx.clone(),
        staging_target_path: STAGING.into(),
        target_path: TARGET.into(),
        volume_capability: VolumeCapability::mount("ext4"),
        read_only: false,
    })
}

/// Create, attach, stage, publish and then tear everything down again.
async fn full_cycle(plugin: &Plugin) {
    let vol = plugin.create("data-1", 10).await;
    let remote = plugin.cloud.volume(&vol.volume_id).unwrap();
    assert_eq!(remote.name, "data-1");
    assert_eq!(remote.size_bytes, 10 * GIB);

    let ctx = plugin.attach(&vol.volume_id, NODE).await.unwrap();
    let device = PathBuf::from(&ctx[PUBLISH_CONTEXT_DEVICE_PATH]);
    assert_eq!(
        plugin.cloud.volume(&vol.volume_id).unwrap().server,
        Some(NodeId::from(NODE))
    );
    plugin.mounter.add_device(&device);

    plugin.call(stage_msg(&vol.volume_id, &ctx)).await.unwrap();
    let staged = plugin.mounter.mount_at(STAGING).unwrap();
    assert_eq!(staged.source, device);
    assert_eq!(staged.fs_type.as_deref(), Some("ext4"));
    assert_eq!(
        plugin.mounter.filesystem(&device).await.unwrap().as_deref(),
        Some("ext4")
    );

    plugin.call(publish_msg(&vol.volume_id, &ctx)).await.unwrap();
    let published = plugin.mounter.mount_at(TARGET).unwrap();
    assert!(published.is_bind());
    assert_eq!(published.source, PathBuf::from(STAGING));

    plugin
        .call(CsiMessage::UnpublishVolume {
            volume_id: vol.volume_id.clone(),
            target_path: TARGET.into(),
        })
        .await
        .unwrap();
    plugin
        .call(CsiMessage::UnstageVolume {
            volume_id: vol.volume_id.clone(),
            staging_target_path: STAGING.into(),
        })
        .await
        .unwrap();
    plugin
        .call(CsiMessage::ControllerUnpublishVolume(
            ControllerUnpublishVolumeRequest {
                volume_id: vol.volume_id.clone(),
                node_id: NODE.into(),
            },
        ))
        .await
        .unwrap();
    plugin
        .call(CsiMessage::DeleteVolume(vol.volume_id.clone()))
        .await
        .unwrap();

    assert!(plugin.cloud.volumes().is_empty());
    assert!(plugin.mounter.mounts().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_leaves_nothing_behind() {
    let plugin = Plugin::start().await;

    full_cycle(&plugin).await;
    let after_first = plugin.cloud.calls();
    full_cycle(&plugin).await;
    let after_second = plugin.cloud.calls();

    assert_eq!(after_first.create, 1);
    assert_eq!(after_first.attach, 1);
    assert_eq!(after_first.detach, 1);
    assert_eq!(after_first.delete, 1);
    assert_eq!(after_second.create, 2);
    assert_eq!(after_second.attach, 2);
    assert_eq!(after_second.detach, 2);
    assert_eq!(after_second.delete, 2);

    plugin.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_attach_issues_one_remote_call() {
    let plugin = Arc::new(Plugin::start().await);
    let vol = plugin.create("data-1", 10).await;

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let plugin = Arc::clone(&plugin);
            let id = vol.volume_id.clone();
            tokio::spawn(async move { plugin.attach(&id, NODE).await })
        })
        .collect();
    for t in tasks {
        t.await.unwrap().unwrap();
    }
    assert_eq!(plugin.cloud.calls().attach, 1);

    let err = plugin.attach(&vol.volume_id, "2").await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    let plugin = Arc::try_unwrap(plugin).ok().unwrap();
    plugin.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn node_rejects_out_of_order_calls() {
    let plugin = Plugin::start().await;
    let vol = plugin.create("data-1", 10).await;
    let ctx = plugin.attach(&vol.volume_id, NODE).await.unwrap();
    plugin
        .mounter
        .add_device(&ctx[PUBLISH_CONTEXT_DEVICE_PATH]);

    let err = plugin
        .call(publish_msg(&vol.volume_id, &ctx))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    plugin.call(stage_msg(&vol.volume_id, &ctx)).await.unwrap();
    plugin.call(publish_msg(&vol.volume_id, &ctx)).await.unwrap();
    let err = plugin
        .call(CsiMessage::UnstageVolume {
            volume_id: vol.volume_id.clone(),
            staging_target_path: STAGING.into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    let err = plugin
        .call(CsiMessage::DeleteVolume(vol.volume_id.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    plugin.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn identity_and_capabilities() {
    let plugin = Plugin::start().await;

    match plugin.call(CsiMessage::GetPluginInfo).await.unwrap() {
        CsiMessage::PluginInfoResponse(info) => assert_eq!(info.name, "rk8s.hcloud.csi"),
        other => panic!("unexpected response {other}"),
    }
    match plugin.call(CsiMessage::ControllerGetCapabilities).await.unwrap() {
        CsiMessage::ControllerCapabilitiesResponse(caps) => {
            assert!(caps.contains(&ControllerCapability::PublishUnpublishVolume))
        }
        other => panic!("unexpected response {other}"),
    }
    match plugin.call(CsiMessage::NodeGetCapabilities).await.unwrap() {
        CsiMessage::NodeCapabilitiesResponse(caps) => {
            assert_eq!(caps, vec![NodeCapability::StageUnstageVolume])
        }
        other => panic!("unexpected response {other}"),
    }
    match plugin.call(CsiMessage::GetNodeInfo).await.unwrap() {
        CsiMessage::NodeInfoResponse(info) => {
            assert_eq!(info.node_id, NodeId::from(NODE));
            assert_eq!(info.accessible_topology, Some(Topology::location("fsn1")));
        }
        other => panic!("unexpected response {other}"),
    }

    plugin.close().await;
}
