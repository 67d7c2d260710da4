//! Security resolution for ZooKeeper ensembles
//!
//! Turns the declarative `spec.clusterConfig` security settings plus any
//! referenced `AuthenticationClass` objects into one [`ZookeeperSecurity`]
//! value: whether TLS is on, which port clients connect to, and the
//! `zoo.cfg` properties implementing the decision. Resolution happens on
//! every reconcile pass; nothing is cached across passes.

use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::crd::{
    AuthenticationClass, ZookeeperCluster, ZookeeperTls, CLIENT_PORT, SECURE_CLIENT_PORT,
};
use crate::error::{OperatorError, Result};

/// Mount directories for TLS material inside server pods
pub const QUORUM_TLS_DIR: &str = "/quorumops/quorum_tls";
pub const SERVER_TLS_DIR: &str = "/quorumops/server_tls";
pub const CLIENT_AUTH_TLS_DIR: &str = "/quorumops/client_auth";

/// Password for the generated PKCS12 stores. The stores only exist inside
/// the pod filesystem, the password is not a secret.
const STORE_PASSWORD: &str = "changeit";

/// Resolved security posture of one ZookeeperCluster
#[derive(Debug, Clone, PartialEq)]
pub struct ZookeeperSecurity {
    quorum_secret_class: String,
    server_secret_class: Option<String>,
    /// TLS client authentication, if an AuthenticationClass is referenced
    client_auth: Option<TlsClientAuth>,
}

/// A resolved TLS AuthenticationClass
#[derive(Debug, Clone, PartialEq)]
pub struct TlsClientAuth {
    pub class_name: String,
    /// Trust material for validating client certificates; `None` falls
    /// back to the server's own secret class
    pub client_cert_secret_class: Option<String>,
}

impl ZookeeperSecurity {
    /// Fetch referenced AuthenticationClass objects and build the resolved
    /// security posture.
    #[instrument(skip(client, cluster), fields(cluster = %cluster.name_any()))]
    pub async fn resolve(client: &Client, cluster: &ZookeeperCluster) -> Result<Self> {
        let refs = &cluster.spec.cluster_config.authentication;
        let api: Api<AuthenticationClass> = Api::all(client.clone());

        let mut classes = Vec::with_capacity(refs.len());
        for auth_ref in refs {
            let class = api.get_opt(&auth_ref.authentication_class).await?.ok_or_else(|| {
                OperatorError::NotFound(format!(
                    "AuthenticationClass '{}'",
                    auth_ref.authentication_class
                ))
            })?;
            classes.push(class);
        }

        Self::new(cluster.spec.cluster_config.tls.as_ref(), &classes)
    }

    /// Build the security posture from already-fetched inputs.
    pub fn new(tls: Option<&ZookeeperTls>, auth_classes: &[AuthenticationClass]) -> Result<Self> {
        if auth_classes.len() > 1 {
            return Err(OperatorError::ValidationError(format!(
                "only one authentication class is supported, found {}",
                auth_classes.len()
            )));
        }

        let client_auth = match auth_classes.first() {
            None => None,
            Some(class) => {
                let name = class.name_any();
                let provider = &class.spec.provider;
                match &provider.tls {
                    Some(tls_provider)
                        if provider.ldap.is_none()
                            && provider.oidc.is_none()
                            && provider.r#static.is_none() =>
                    {
                        Some(TlsClientAuth {
                            class_name: name,
                            client_cert_secret_class: tls_provider
                                .client_cert_secret_class
                                .clone(),
                        })
                    }
                    _ => {
                        return Err(OperatorError::ValidationError(format!(
                            "AuthenticationClass '{}' does not use the TLS provider; \
                             only TLS authentication is supported",
                            name
                        )))
                    }
                }
            }
        };

        let tls = tls.cloned().unwrap_or_default();
        let security = Self {
            quorum_secret_class: tls.quorum_secret_class,
            server_secret_class: tls.server_secret_class,
            client_auth,
        };
        debug!(
            tls_enabled = security.tls_enabled(),
            client_port = security.client_port(),
            "resolved security posture"
        );
        Ok(security)
    }

    /// Whether client connections use TLS
    pub fn tls_enabled(&self) -> bool {
        self.server_secret_class.is_some() || self.client_auth.is_some()
    }

    /// The effective client port. Single source of truth: every rendered
    /// config, discovery descriptor and status field derives from this.
    pub fn client_port(&self) -> u16 {
        if self.tls_enabled() {
            SECURE_CLIENT_PORT
        } else {
            CLIENT_PORT
        }
    }

    /// Secret class protecting quorum traffic
    pub fn quorum_secret_class(&self) -> &str {
        &self.quorum_secret_class
    }

    /// Secret class protecting client traffic, if any
    pub fn server_secret_class(&self) -> Option<&str> {
        self.server_secret_class.as_deref()
    }

    /// The `zoo.cfg` properties implementing this security posture
    pub fn config_settings(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();

        // Quorum TLS: mutual verification between ensemble members.
        props.insert("sslQuorum".to_string(), "true".to_string());
        props.insert(
            "ssl.quorum.hostnameVerification".to_string(),
            "true".to_string(),
        );
        props.insert("ssl.quorum.clientAuth".to_string(), "need".to_string());
        props.insert(
            "serverCnxnFactory".to_string(),
            "org.apache.zookeeper.server.NettyServerCnxnFactory".to_string(),
        );
        props.insert(
            "authProvider.x509".to_string(),
            "org.apache.zookeeper.server.auth.X509AuthenticationProvider".to_string(),
        );
        props.insert(
            "ssl.quorum.keyStore.location".to_string(),
            format!("{QUORUM_TLS_DIR}/keystore.p12"),
        );
        props.insert(
            "ssl.quorum.keyStore.password".to_string(),
            STORE_PASSWORD.to_string(),
        );
        props.insert(
            "ssl.quorum.trustStore.location".to_string(),
            format!("{QUORUM_TLS_DIR}/truststore.p12"),
        );
        props.insert(
            "ssl.quorum.trustStore.password".to_string(),
            STORE_PASSWORD.to_string(),
        );

        props.insert("clientPort".to_string(), self.client_port().to_string());

        if self.tls_enabled() {
            // ZOOKEEPER-4276: with a plain clientPort plus ssl properties the
            // server binds TLS on the same port only in unification mode.
            props.insert("client.portUnification".to_string(), "true".to_string());
            props.insert("ssl.hostnameVerification".to_string(), "true".to_string());
            props.insert(
                "ssl.keyStore.location".to_string(),
                format!("{SERVER_TLS_DIR}/keystore.p12"),
            );
            props.insert("ssl.keyStore.password".to_string(), STORE_PASSWORD.to_string());

            // Trust anchors for client certificates come from the auth
            // class when it supplies its own secret class.
            let truststore_dir = match &self.client_auth {
                Some(auth) if auth.client_cert_secret_class.is_some() => CLIENT_AUTH_TLS_DIR,
                _ => SERVER_TLS_DIR,
            };
            props.insert(
                "ssl.trustStore.location".to_string(),
                format!("{truststore_dir}/truststore.p12"),
            );
            props.insert(
                "ssl.trustStore.password".to_string(),
                STORE_PASSWORD.to_string(),
            );

            if self.client_auth.is_some() {
                props.insert("ssl.clientAuth".to_string(), "need".to_string());
            }
        }

        props
    }
}
