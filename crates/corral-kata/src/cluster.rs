use crate::api::{ApiError, ExecFrame, ExecStream, PodApi, CONTAINER_NAME};
use async_trait::async_trait;
use corral_runtime::InputStream;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

const FIELD_MANAGER: &str = "corral";

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => ApiError::NotFound(resp.message),
                409 => ApiError::Conflict(resp.message),
                403 => ApiError::Forbidden(resp.message),
                400 | 422 => ApiError::Invalid(resp.message),
                code => ApiError::Transport(format!("{code} {}: {}", resp.reason, resp.message)),
            },
            other => ApiError::Transport(other.to_string()),
        }
    }
}

/// Exit code carried by an exec completion status.
///
/// The API server reports success as `status: Success` and a non-zero exit as
/// `reason: NonZeroExitCode` with an `ExitCode` cause.
pub fn exit_code_from_status(status: Option<&Status>) -> Result<i32, ApiError> {
    let Some(status) = status else {
        return Err(ApiError::Transport(
            "exec session ended without a status".to_owned(),
        ));
    };
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }
    if status.reason.as_deref() == Some("NonZeroExitCode") {
        let code = status
            .details
            .as_ref()
            .and_then(|d| d.causes.as_ref())
            .and_then(|causes| {
                causes
                    .iter()
                    .find(|c| c.reason.as_deref() == Some("ExitCode"))
            })
            .and_then(|c| c.message.as_deref())
            .and_then(|m| m.parse::<i32>().ok());
        if let Some(code) = code {
            return Ok(code);
        }
    }
    Err(ApiError::Transport(format!(
        "exec failed: {}",
        status.message.as_deref().unwrap_or("unknown error")
    )))
}

/// [`PodApi`] over a live cluster connection.
#[derive(Clone)]
pub struct KubePodApi {
    namespace: String,
    pods: Api<Pod>,
    policies: Api<NetworkPolicy>,
}

impl KubePodApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            pods: Api::namespaced(client.clone(), namespace),
            policies: Api::namespaced(client, namespace),
        }
    }

    /// Connect using the ambient kubeconfig or in-cluster service account.
    pub async fn try_default(namespace: &str) -> Result<Self, ApiError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ApiError> {
        Ok(self.pods.create(&PostParams::default(), pod).await?)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ApiError> {
        Ok(self.pods.get_opt(name).await?)
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ApiError> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        self.pods.delete(name, &params).await?;
        Ok(())
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ApiError> {
        let list = self
            .pods
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn exec(
        &self,
        pod: &str,
        command: Vec<String>,
        stdin: Option<InputStream>,
    ) -> Result<ExecStream, ApiError> {
        let params = AttachParams::default()
            .container(CONTAINER_NAME)
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);
        let mut attached = self.pods.exec(pod, command, &params).await?;

        if let (Some(mut input), Some(mut writer)) = (stdin, attached.stdin()) {
            tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut input, &mut writer).await {
                    debug!("exec stdin copy ended early: {e}");
                }
                let _ = writer.shutdown().await;
            });
        }

        let stdout = match attached.stdout() {
            Some(r) => ReaderStream::new(r)
                .map(|c| {
                    c.map(ExecFrame::Stdout)
                        .map_err(|e| ApiError::Transport(e.to_string()))
                })
                .boxed(),
            None => stream::empty().boxed(),
        };
        let stderr = match attached.stderr() {
            Some(r) => ReaderStream::new(r)
                .map(|c| {
                    c.map(ExecFrame::Stderr)
                        .map_err(|e| ApiError::Transport(e.to_string()))
                })
                .boxed(),
            None => stream::empty().boxed(),
        };
        let status = attached.take_status();

        let exit = stream::once(async move {
            let status = match status {
                Some(pending) => pending.await,
                None => None,
            };
            if let Err(e) = attached.join().await {
                debug!("exec session closed with error: {e}");
            }
            exit_code_from_status(status.as_ref()).map(ExecFrame::Exit)
        });

        Ok(stream::select(stdout, stderr).chain(exit).boxed())
    }

    async fn apply_network_policy(&self, policy: &NetworkPolicy) -> Result<(), ApiError> {
        let name = policy
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ApiError::Invalid("network policy has no name".to_owned()))?;
        self.policies
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(policy),
            )
            .await?;
        Ok(())
    }

    async fn delete_network_policy(&self, name: &str) -> Result<(), ApiError> {
        self.policies
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
