use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, DeleteOptions, GetOptions, KvClient,
    TlsOptions, Txn, TxnOp,
};
use tracing::debug;

use super::{Coordinator, Entry};
use crate::config::CoordinationConfig;
use crate::{Error, Result};

/// A [`Coordinator`] backed by an etcd v3 cluster. Every key is namespaced under the configured
/// prefix.
#[derive(Clone)]
pub struct EtcdCoordinator {
    kv: KvClient,
    prefix: String,
}

impl EtcdCoordinator {
    /// Connects to the configured endpoints.
    pub async fn connect(config: &CoordinationConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(Error::Coordination(
                "no coordination store endpoints configured".to_string(),
            ));
        }
        let mut options = ConnectOptions::new();
        if !config.username.is_empty() {
            options = options.with_user(config.username.clone(), config.password.clone());
        }
        if let Some(path) = &config.cert_path {
            let pem = tokio::fs::read(path).await?;
            options = options.with_tls(TlsOptions::new().ca_certificate(Certificate::from_pem(pem)));
        }
        debug!(endpoints = ?config.endpoints, prefix = %config.prefix, "Connecting to coordination store");
        let client = Client::connect(&config.endpoints, Some(options)).await?;
        Ok(EtcdCoordinator {
            kv: client.kv_client(),
            prefix: config.prefix.clone(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn relative_key(&self, key: &str) -> String {
        key.strip_prefix(self.prefix.as_str())
            .unwrap_or(key)
            .to_string()
    }
}

#[async_trait::async_trait]
impl Coordinator for EtcdCoordinator {
    async fn put_if_key_missing(&self, key: &str, value: &str) -> Result<bool> {
        let full = self.full_key(key);
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                full.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(full.as_str(), value, None)]);
        let resp = self.kv.clone().txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn get(&self, key: &str, prefix: bool) -> Result<Vec<Entry>> {
        let options = if prefix {
            Some(GetOptions::new().with_prefix())
        } else {
            None
        };
        let resp = self.kv.clone().get(self.full_key(key), options).await?;
        resp.kvs()
            .iter()
            .map(|kv| {
                Ok(Entry {
                    key: self.relative_key(kv.key_str()?),
                    value: kv.value_str()?.to_string(),
                })
            })
            .collect()
    }

    async fn delete_key_if_exists(&self, key: &str) -> Result<bool> {
        let full = self.full_key(key);
        let txn = Txn::new()
            .when(vec![Compare::version(full.as_str(), CompareOp::Greater, 0)])
            .and_then(vec![TxnOp::delete(full.as_str(), None)]);
        let resp = self.kv.clone().txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn delete_key_with_prefix(&self, prefix: &str) -> Result<()> {
        self.kv
            .clone()
            .delete(self.full_key(prefix), Some(DeleteOptions::new().with_prefix()))
            .await?;
        Ok(())
    }
}
