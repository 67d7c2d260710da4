//! ZooKeeper ensemble client
//!
//! Wraps the `zookeeper-client` crate behind the small [`ZnodeSession`]
//! trait so the recursive znode operations can be exercised against an
//! in-memory session in tests. All session operations are idempotent at
//! this layer: creating an existing node and deleting an absent one both
//! succeed, which is what reconcile loops want.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::error::{OperatorError, Result};

/// Connect timeout towards the ensemble
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Operations on a live ZooKeeper session
#[async_trait]
pub trait ZnodeSession: Send + Sync {
    /// Whether a node exists at `path`
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create a persistent node at `path`; succeeds if it already exists
    async fn create(&self, path: &str) -> Result<()>;

    /// Children of `path`; an absent node has no children
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Delete the node at `path`; succeeds if it is already gone
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Create `path` unless it is already present.
///
/// The exists-check keeps repeated reconciles from issuing writes against
/// the ensemble.
pub async fn ensure_created<S: ZnodeSession + ?Sized>(session: &S, path: &str) -> Result<()> {
    if session.exists(path).await? {
        debug!(path, "znode already present");
        return Ok(());
    }
    session.create(path).await?;
    debug!(path, "znode created");
    Ok(())
}

/// Delete the subtree rooted at `path`, depth first.
///
/// Concurrent disappearance of any node (another deleter, session
/// takeover after a partial previous run) counts as success.
pub fn delete_recursive<'a, S: ZnodeSession + ?Sized>(
    session: &'a S,
    path: &'a str,
) -> BoxFuture<'a, Result<()>> {
    async move {
        for child in session.children(path).await? {
            let child_path = if path == "/" {
                format!("/{child}")
            } else {
                format!("{path}/{child}")
            };
            delete_recursive(session, &child_path).await?;
        }
        session.delete(path).await
    }
    .boxed()
}

/// A connected ZooKeeper client session
pub struct ZookeeperEnsembleClient {
    client: zookeeper_client::Client,
}

impl ZookeeperEnsembleClient {
    /// Connect to an ensemble, bounded by [`CONNECT_TIMEOUT`].
    ///
    /// `connect_string` is a comma-separated `host:port` list, optionally
    /// with a chroot suffix.
    #[instrument]
    pub async fn connect(connect_string: &str) -> Result<Self> {
        let client = timeout(
            CONNECT_TIMEOUT,
            zookeeper_client::Client::connect(connect_string),
        )
        .await
        .map_err(|_| {
            OperatorError::Timeout(format!("connecting to ensemble at {connect_string}"))
        })?
        .map_err(|e| OperatorError::ZooKeeper(format!("connect to {connect_string}: {e}")))?;
        debug!(connect_string, "connected to ensemble");
        Ok(Self { client })
    }
}

#[async_trait]
impl ZnodeSession for ZookeeperEnsembleClient {
    async fn exists(&self, path: &str) -> Result<bool> {
        match self.client.check_stat(path).await {
            Ok(stat) => Ok(stat.is_some()),
            Err(e) => Err(OperatorError::ZooKeeper(format!("stat {path}: {e}"))),
        }
    }

    async fn create(&self, path: &str) -> Result<()> {
        let options =
            zookeeper_client::CreateMode::Persistent.with_acls(zookeeper_client::Acls::anyone_all());
        match self.client.create(path, &[], &options).await {
            Ok(_) => Ok(()),
            Err(zookeeper_client::Error::NodeExists) => Ok(()),
            Err(e) => Err(OperatorError::ZooKeeper(format!("create {path}: {e}"))),
        }
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        match self.client.list_children(path).await {
            Ok(children) => Ok(children),
            Err(zookeeper_client::Error::NoNode) => Ok(Vec::new()),
            Err(e) => Err(OperatorError::ZooKeeper(format!("list children of {path}: {e}"))),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self.client.delete(path, None).await {
            Ok(()) => Ok(()),
            Err(zookeeper_client::Error::NoNode) => Ok(()),
            Err(e) => Err(OperatorError::ZooKeeper(format!("delete {path}: {e}"))),
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// In-memory znode tree recording every mutating call
    #[derive(Default)]
    pub struct MockSession {
        pub nodes: Mutex<BTreeSet<String>>,
        pub create_calls: Mutex<Vec<String>>,
        pub delete_calls: Mutex<Vec<String>>,
    }

    impl MockSession {
        pub fn with_nodes(paths: &[&str]) -> Self {
            Self {
                nodes: Mutex::new(paths.iter().map(|p| p.to_string()).collect()),
                ..Default::default()
            }
        }

        pub fn contains(&self, path: &str) -> bool {
            self.nodes.lock().unwrap().contains(path)
        }
    }

    #[async_trait]
    impl ZnodeSession for MockSession {
        async fn exists(&self, path: &str) -> Result<bool> {
            Ok(self.nodes.lock().unwrap().contains(path))
        }

        async fn create(&self, path: &str) -> Result<()> {
            self.create_calls.lock().unwrap().push(path.to_string());
            self.nodes.lock().unwrap().insert(path.to_string());
            Ok(())
        }

        async fn children(&self, path: &str) -> Result<Vec<String>> {
            let prefix = if path == "/" {
                "/".to_string()
            } else {
                format!("{path}/")
            };
            let nodes = self.nodes.lock().unwrap();
            Ok(nodes
                .iter()
                .filter_map(|n| {
                    let rest = n.strip_prefix(&prefix)?;
                    if rest.is_empty() || rest.contains('/') {
                        None
                    } else {
                        Some(rest.to_string())
                    }
                })
                .collect())
        }

        async fn delete(&self, path: &str) -> Result<()> {
            self.delete_calls.lock().unwrap().push(path.to_string());
            self.nodes.lock().unwrap().remove(path);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockSession;
    use super::*;

    #[tokio::test]
    async fn test_double_create_is_a_no_op() {
        let session = MockSession::default();
        ensure_created(&session, "/znode-abc").await.unwrap();
        ensure_created(&session, "/znode-abc").await.unwrap();

        assert!(session.contains("/znode-abc"));
        // the second call must not have issued another create
        assert_eq!(session.create_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recursive_delete_removes_two_level_tree() {
        let session = MockSession::with_nodes(&[
            "/znode-abc",
            "/znode-abc/brokers",
            "/znode-abc/brokers/ids",
            "/znode-abc/config",
        ]);
        delete_recursive(&session, "/znode-abc").await.unwrap();

        assert!(session.nodes.lock().unwrap().is_empty());
        // children before parents
        let deletes = session.delete_calls.lock().unwrap();
        let root_pos = deletes.iter().position(|p| p == "/znode-abc").unwrap();
        assert_eq!(root_pos, deletes.len() - 1);
    }

    #[tokio::test]
    async fn test_delete_of_absent_tree_succeeds() {
        let session = MockSession::default();
        delete_recursive(&session, "/znode-gone").await.unwrap();
    }
}
