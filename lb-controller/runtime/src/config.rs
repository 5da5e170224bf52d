use regex::Regex;
use std::{str::FromStr, time::Duration};

/// Service id used by the provider SDK for the ELBv2 API.
pub const ELBV2_SERVICE_ID: &str = "Elastic Load Balancing v2";

pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 3;
pub const DEFAULT_VPC_CACHE_DURATION: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_RETRIES: usize = 10;

/// Fully validated process configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub controller: ControllerConfig,
    pub cloud: CloudConfig,

    /// Deadline for a single reconcile pass.
    pub reconcile_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    pub cluster_name: String,
    pub service_max_concurrent_reconciles: usize,
    pub targetgroupbinding_max_concurrent_reconciles: usize,
}

#[derive(Clone, Debug)]
pub struct CloudConfig {
    pub region: String,
    pub throttle: ThrottleConfig,

    /// The VPC load balancers are created in. Empty means discover it.
    pub vpc_id: String,
    pub vpc_cache_duration: Duration,
    pub max_retries: usize,
}

/// Per-operation request rate limits, evaluated in order.
#[derive(Clone, Debug)]
pub struct ThrottleConfig {
    rules: Vec<ThrottleRule>,
}

#[derive(Clone, Debug)]
pub struct ThrottleRule {
    pub service_id: String,
    pub operation: Regex,
    /// Requests per second.
    pub rate: f64,
    pub burst: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cluster name must be specified")]
    MissingClusterName,

    #[error("{0} must be greater than zero")]
    ZeroConcurrency(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidThrottle {
    #[error("expected serviceID:operationRegex=rate:burst, got {0:?}")]
    Malformed(String),

    #[error("invalid operation pattern: {0}")]
    Operation(#[from] regex::Error),

    #[error("invalid rate {0:?}")]
    Rate(String),

    #[error("invalid burst {0:?}")]
    Burst(String),
}

// === impl ControllerConfig ===

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            service_max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            targetgroupbinding_max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_name.is_empty() {
            return Err(ConfigError::MissingClusterName);
        }
        if self.service_max_concurrent_reconciles == 0 {
            return Err(ConfigError::ZeroConcurrency(
                "service-max-concurrent-reconciles",
            ));
        }
        if self.targetgroupbinding_max_concurrent_reconciles == 0 {
            return Err(ConfigError::ZeroConcurrency(
                "targetgroupbinding-max-concurrent-reconciles",
            ));
        }
        Ok(())
    }
}

// === impl CloudConfig ===

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            region: String::new(),
            throttle: ThrottleConfig::default(),
            vpc_id: String::new(),
            vpc_cache_duration: DEFAULT_VPC_CACHE_DURATION,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

// === impl ThrottleConfig ===

impl Default for ThrottleConfig {
    fn default() -> Self {
        let operation = Regex::new("^RegisterTargets|^DeregisterTargets")
            .expect("default throttle pattern must compile");
        Self {
            rules: vec![ThrottleRule {
                service_id: ELBV2_SERVICE_ID.to_string(),
                operation,
                rate: 4.0,
                burst: 20,
            }],
        }
    }
}

impl ThrottleConfig {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn rules(&self) -> &[ThrottleRule] {
        &self.rules
    }

    /// Returns a config where `overrides` are consulted before these rules.
    pub fn with_overrides(self, overrides: ThrottleConfig) -> Self {
        let mut rules = overrides.rules;
        rules.extend(self.rules);
        Self { rules }
    }

    /// Returns the first rule matching the operation.
    pub fn limit_for(&self, service_id: &str, operation: &str) -> Option<&ThrottleRule> {
        self.rules
            .iter()
            .find(|rule| rule.service_id == service_id && rule.operation.is_match(operation))
    }
}

impl FromStr for ThrottleConfig {
    type Err = InvalidThrottle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rules = s
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::parse::<ThrottleRule>)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }
}

// === impl ThrottleRule ===

impl FromStr for ThrottleRule {
    type Err = InvalidThrottle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || InvalidThrottle::Malformed(s.to_string());

        let (service_id, rest) = s.split_once(':').ok_or_else(malformed)?;
        let (operation, limit) = rest.rsplit_once('=').ok_or_else(malformed)?;
        let (rate, burst) = limit.split_once(':').ok_or_else(malformed)?;
        if service_id.trim().is_empty() || operation.is_empty() {
            return Err(malformed());
        }

        let rate = rate
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|r| r.is_finite() && *r > 0.0)
            .ok_or_else(|| InvalidThrottle::Rate(rate.to_string()))?;
        let burst = burst
            .trim()
            .parse::<usize>()
            .map_err(|_| InvalidThrottle::Burst(burst.to_string()))?;

        Ok(Self {
            service_id: service_id.trim().to_string(),
            operation: Regex::new(operation)?,
            rate,
            burst,
        })
    }
}
