use crate::{Api, Client, Pod, Resource};
use futures::future;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{AttachParams, DeleteParams, ListParams, PostParams};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const LIST_PAGE_SIZE: u32 = 500;

/// Typed access to namespaced cluster objects, plus the ability to run a
/// command inside a running container.
///
/// Reads map not-found to `None`; deletes of objects that are already gone
/// succeed. Writes use the resource version carried by the object, so a
/// concurrent modification fails rather than being overwritten.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync + 'static {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>;

    /// Lists objects matching a label selector across all namespaces.
    async fn list<K: Object>(&self, selector: &str) -> Result<Vec<K>, Error>;

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, Error>;

    async fn replace<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, Error>;

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Runs a command to completion, failing unless it exits successfully.
    async fn exec(&self, target: &ExecTarget, command: Vec<String>) -> Result<ExecOutput, Error>;
}

/// Namespaced objects that can be read and written through a [`Cluster`].
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("{kind} must have a name")]
    Unnamed { kind: String },

    #[error("{kind} {name} has no uid to own its dependents")]
    MissingUid { kind: String, name: String },

    #[error("command failed in {pod}/{container}: {message}")]
    ExecFailed {
        pod: String,
        container: String,
        message: String,
    },

    #[error("failed to read command output: {0}")]
    ExecIo(#[from] std::io::Error),
}

/// A [`Cluster`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

// === impl Error ===

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(rsp)) if rsp.code == 404)
    }
}

// === impl KubeCluster ===

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: Object>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error> {
        let obj = self.api::<K>(namespace).get_opt(name).await?;
        Ok(obj)
    }

    async fn list<K: Object>(&self, selector: &str) -> Result<Vec<K>, Error> {
        let api = Api::<K>::all(self.client.clone());
        let mut params = ListParams::default().labels(selector).limit(LIST_PAGE_SIZE);
        let mut items = Vec::new();
        loop {
            let list = api.list(&params).await?;
            items.extend(list.items);
            match list.metadata.continue_ {
                Some(token) if !token.is_empty() => params = params.continue_token(&token),
                _ => return Ok(items),
            }
        }
    }

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, Error> {
        let created = self
            .api::<K>(namespace)
            .create(&PostParams::default(), obj)
            .await?;
        Ok(created)
    }

    async fn replace<K: Object>(&self, namespace: &str, obj: &K) -> Result<K, Error> {
        let name = obj.meta().name.as_deref().ok_or_else(|| Error::Unnamed {
            kind: K::kind(&()).to_string(),
        })?;
        let replaced = self
            .api::<K>(namespace)
            .replace(name, &PostParams::default(), obj)
            .await?;
        Ok(replaced)
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(error) => {
                let error = Error::from(error);
                if error.is_not_found() {
                    return Ok(());
                }
                Err(error)
            }
        }
    }

    async fn exec(&self, target: &ExecTarget, command: Vec<String>) -> Result<ExecOutput, Error> {
        tracing::info!(pod = %target.pod, container = %target.container, ?command, "Running in pod");

        let params = AttachParams::default()
            .container(target.container.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut process = self
            .api::<Pod>(&target.namespace)
            .exec(&target.pod, command, &params)
            .await?;

        let stdout = process.stdout();
        let stderr = process.stderr();
        let status = process.take_status();
        let (stdout, stderr) = future::try_join(read_all(stdout), read_all(stderr)).await?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        match status {
            Some(status) if status.status.as_deref() == Some("Success") => {
                Ok(ExecOutput { stdout, stderr })
            }
            status => {
                let message = status
                    .and_then(|s| s.message)
                    .unwrap_or_else(|| "no exit status".to_string());
                Err(Error::ExecFailed {
                    pod: target.pod.clone(),
                    container: target.container.clone(),
                    message: format!("{message}: {}", String::from_utf8_lossy(&stderr).trim()),
                })
            }
        }
    }
}

async fn read_all(reader: Option<impl AsyncRead + Unpin>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

