use crate::paths;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("At least one ensemble server is required")]
    NoServers,

    #[error("Empty ensemble server address")]
    EmptyServer,

    #[error("Base path {0:?} must be an absolute path")]
    InvalidBasePath(String),

    #[error("Session timeout must be greater than 0")]
    ZeroSessionTimeout,

    #[error("Connect timeout must be greater than 0")]
    ZeroConnectTimeout,

    #[error("Members path {0:?} must be an absolute path")]
    InvalidMembersPath(String),

    #[error("Advertised address {0:?} is not a valid member name")]
    InvalidAdvertise(String),
}

/// Coordination ensemble configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ClusterConfig {
    /// Ensemble members as `host:port`
    pub servers: Vec<String>,
    /// Every watched or created path lives below this node
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// How long `connect` keeps trying before giving up
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_base_path() -> String {
    "/shardgate".to_string()
}

fn default_session_timeout_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl ClusterConfig {
    pub fn new(servers: Vec<String>, base_path: &str) -> Self {
        ClusterConfig {
            servers,
            base_path: base_path.to_string(),
            session_timeout_ms: default_session_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.servers.is_empty() {
            return Err(ValidationError::NoServers);
        }
        if self.servers.iter().any(|server| server.trim().is_empty()) {
            return Err(ValidationError::EmptyServer);
        }
        if !paths::is_valid(&self.base_path) {
            return Err(ValidationError::InvalidBasePath(self.base_path.clone()));
        }
        if self.session_timeout_ms == 0 {
            return Err(ValidationError::ZeroSessionTimeout);
        }
        if self.connect_timeout_ms == 0 {
            return Err(ValidationError::ZeroConnectTimeout);
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// How this node takes part in the cluster: the ensemble to use, where
/// members register and the address this node registers under.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MembershipConfig {
    pub ensemble: ClusterConfig,
    /// Relative to the ensemble base path. Every member is a child named
    /// after its `host:port`.
    #[serde(default = "default_members_path")]
    pub members_path: String,
    /// Address the other members reach this node's proxy listener on.
    pub advertise: String,
}

fn default_members_path() -> String {
    "/members".to_string()
}

impl MembershipConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.ensemble.validate()?;
        if !paths::is_valid(&self.members_path) || self.members_path == paths::ROOT {
            return Err(ValidationError::InvalidMembersPath(
                self.members_path.clone(),
            ));
        }
        if self.member_node().is_none() {
            return Err(ValidationError::InvalidAdvertise(self.advertise.clone()));
        }
        Ok(())
    }

    /// Path of this node's own registration, relative to the base path.
    pub fn member_node(&self) -> Option<String> {
        let node = format!("{}/{}", self.members_path, self.advertise);
        (paths::is_valid(&node) && paths::name(&node) == self.advertise).then_some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let yaml = r#"
servers:
    - zk1:2181
    - zk2:2181
"#;
        let config: ClusterConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.base_path, "/shardgate");
        assert_eq!(config.session_timeout(), Duration::from_secs(5));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_overrides() {
        let yaml = r#"
servers: [zk1:2181]
base_path: /shardgate/prod
session_timeout_ms: 10000
connect_timeout_ms: 250
"#;
        let config: ClusterConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.base_path, "/shardgate/prod");
        assert_eq!(config.connect_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_membership() {
        let yaml = r#"
ensemble:
    servers: [zk1:2181]
advertise: 10.0.0.1:9599
"#;
        let config: MembershipConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.ensemble.base_path, "/shardgate");
        assert_eq!(config.members_path, "/members");
        assert_eq!(config.member_node().unwrap(), "/members/10.0.0.1:9599");
    }

    #[test]
    fn test_membership_validation() {
        let mut config = MembershipConfig {
            ensemble: ClusterConfig::new(vec!["zk1:2181".to_string()], "/shardgate"),
            members_path: "/members".to_string(),
            advertise: "10.0.0.1:9599".to_string(),
        };
        assert!(config.validate().is_ok());

        config.advertise = "10.0.0.1:9599/extra".to_string();
        assert_eq!(
            config.validate(),
            Err(ValidationError::InvalidAdvertise("10.0.0.1:9599/extra".to_string()))
        );
        config.advertise = "..".to_string();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidAdvertise(_))
        ));

        config.advertise = "10.0.0.1:9599".to_string();
        config.members_path = "/".to_string();
        assert_eq!(
            config.validate(),
            Err(ValidationError::InvalidMembersPath("/".to_string()))
        );

        config.members_path = "/members".to_string();
        config.ensemble.servers.clear();
        assert_eq!(config.validate(), Err(ValidationError::NoServers));
    }

    #[test]
    fn test_validation_errors() {
        let base_config = ClusterConfig::new(vec!["zk1:2181".to_string()], "/shardgate");
        assert!(base_config.validate().is_ok());

        let mut config = base_config.clone();
        config.servers.clear();
        assert_eq!(config.validate(), Err(ValidationError::NoServers));

        let mut config = base_config.clone();
        config.servers.push("".to_string());
        assert_eq!(config.validate(), Err(ValidationError::EmptyServer));

        for bad in ["shardgate", "/shardgate/", "/a//b", ""] {
            let mut config = base_config.clone();
            config.base_path = bad.to_string();
            assert_eq!(
                config.validate(),
                Err(ValidationError::InvalidBasePath(bad.to_string()))
            );
        }

        let mut config = base_config.clone();
        config.session_timeout_ms = 0;
        assert_eq!(config.validate(), Err(ValidationError::ZeroSessionTimeout));

        let mut config = base_config;
        config.connect_timeout_ms = 0;
        assert_eq!(config.validate(), Err(ValidationError::ZeroConnectTimeout));
    }

    #[test]
    fn test_missing_servers_is_rejected() {
        assert!(serde_yaml::from_str::<ClusterConfig>("base_path: /shardgate").is_err());
    }
}
