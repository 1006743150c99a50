use anyhow::{bail, Result};
use serde::Deserialize;

/// The addresses serving one shard: the writable master and any read
/// replicas.
#[derive(Debug, Clone, Deserialize)]
pub struct ShardAddress {
    pub master: String,
    #[serde(default)]
    pub slaves: Vec<String>,
}

/// Shard-to-address lookup. Built once from configuration; nothing here ever
/// changes at runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct Addresser {
    server: String,
    shards: Vec<ShardAddress>,
}

impl Addresser {
    pub fn new(server: String, shards: Vec<ShardAddress>) -> Self {
        Addresser { server, shards }
    }

    pub fn get_master_address(&self, shard: usize) -> Result<&str> {
        match self.shards.get(shard) {
            Some(address) => Ok(&address.master),
            None => bail!(
                "no shard {} (there are {} shards)",
                shard,
                self.shards.len()
            ),
        }
    }

    pub fn get_slave_addresses(&self, shard: usize) -> Result<&[String]> {
        match self.shards.get(shard) {
            Some(address) => Ok(&address.slaves),
            None => bail!(
                "no shard {} (there are {} shards)",
                shard,
                self.shards.len()
            ),
        }
    }

    pub fn get_server_address(&self) -> &str {
        &self.server
    }
}

#[cfg(test)]
mod test_addresser {
    use super::{Addresser, ShardAddress};

    fn addresser() -> Addresser {
        Addresser::new(
            "server:650".to_string(),
            vec![
                ShardAddress {
                    master: "master-0:650".to_string(),
                    slaves: vec!["slave-0a:650".to_string(), "slave-0b:650".to_string()],
                },
                ShardAddress {
                    master: "master-1:650".to_string(),
                    slaves: vec![],
                },
            ],
        )
    }

    #[test]
    fn looks_up_shard_addresses() {
        let addresser = addresser();

        assert_eq!(addresser.get_master_address(0).unwrap(), "master-0:650");
        assert_eq!(addresser.get_master_address(1).unwrap(), "master-1:650");
        assert_eq!(
            addresser.get_slave_addresses(0).unwrap(),
            &["slave-0a:650".to_string(), "slave-0b:650".to_string()],
        );
        assert!(addresser.get_slave_addresses(1).unwrap().is_empty());
        assert_eq!(addresser.get_server_address(), "server:650");
    }

    #[test]
    fn unknown_shards_are_an_error() {
        let addresser = addresser();

        assert!(addresser.get_master_address(2).is_err());
        assert!(addresser.get_slave_addresses(9).is_err());
    }

    #[test]
    fn deserializes_from_config() {
        let addresser: Addresser = serde_json::from_str(
            r#"{
                "server": "server:650",
                "shards": [{"master": "master-0:650"}]
            }"#,
        )
        .unwrap();

        assert_eq!(addresser.get_master_address(0).unwrap(), "master-0:650");
        assert!(addresser.get_slave_addresses(0).unwrap().is_empty());
    }
}
