use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    runtime::events::{Event, Recorder, Reporter},
    Client,
};
use tracing::warn;

/// Side channel for user visible events. Publishing never fails the caller.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, event: Event, reference: ObjectReference);
}

pub struct KubeRecorder {
    recorder: Recorder,
}

impl KubeRecorder {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeRecorder {
    async fn publish(&self, event: Event, reference: ObjectReference) {
        if let Err(err) = self.recorder.publish(&event, &reference).await {
            warn!(reason = %event.reason, "Failed to publish event: {err}");
        }
    }
}
