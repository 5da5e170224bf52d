use crate::config::{CloudConfig, Config, ControllerConfig, ThrottleConfig};
use anyhow::Result;
use clap::Parser;
use std::time::Duration;

#[derive(Debug, Parser)]
#[clap(name = "lb-controller", about = "Reconciles load balancer resources")]
pub struct Args {
    #[clap(
        long,
        default_value = "lb_controller=info,warn",
        env = "LB_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    /// Name of the Kubernetes cluster.
    #[clap(long, default_value = "")]
    cluster_name: String,

    /// Maximum number of concurrently running reconcile loops for services.
    #[clap(long, default_value = "3")]
    service_max_concurrent_reconciles: usize,

    /// Maximum number of concurrently running reconcile loops for target
    /// group bindings.
    #[clap(long, default_value = "3")]
    targetgroupbinding_max_concurrent_reconciles: usize,

    #[clap(long, default_value = "60000")]
    reconcile_timeout_ms: u64,

    /// AWS region of the cluster.
    #[clap(long, default_value = "")]
    aws_region: String,

    /// Throttle settings for AWS APIs, formatted as
    /// `serviceID:operationRegex=rate:burst,...`.
    #[clap(long)]
    aws_api_throttle: Option<ThrottleConfig>,

    /// ID of the VPC to create load balancers in.
    #[clap(long, default_value = "")]
    aws_vpc_id: String,

    /// VPC cache duration in minutes.
    #[clap(long, default_value = "5")]
    aws_vpc_cache_duration: u64,

    /// Maximum retries for AWS APIs.
    #[clap(long, default_value = "10")]
    aws_max_retries: usize,
}

impl Args {
    /// Parses the process arguments, initializes logging and returns the
    /// validated configuration.
    #[inline]
    pub fn parse_and_init() -> Result<Config> {
        Self::parse().init()
    }

    pub fn init(self) -> Result<Config> {
        let config = self.load()?;
        let Self {
            log_level,
            log_format,
            ..
        } = self;
        log_format.try_init(log_level)?;
        tracing::debug!(?config, "Loaded configuration");
        Ok(config)
    }

    /// Validates the arguments without touching global state.
    pub fn load(&self) -> Result<Config> {
        let Self {
            log_level: _,
            log_format: _,
            cluster_name,
            service_max_concurrent_reconciles,
            targetgroupbinding_max_concurrent_reconciles,
            reconcile_timeout_ms,
            aws_region,
            aws_api_throttle,
            aws_vpc_id,
            aws_vpc_cache_duration,
            aws_max_retries,
        } = self;

        let controller = ControllerConfig {
            cluster_name: cluster_name.clone(),
            service_max_concurrent_reconciles: *service_max_concurrent_reconciles,
            targetgroupbinding_max_concurrent_reconciles:
                *targetgroupbinding_max_concurrent_reconciles,
        };
        controller.validate()?;

        let throttle = match aws_api_throttle {
            Some(overrides) => ThrottleConfig::default().with_overrides(overrides.clone()),
            None => ThrottleConfig::default(),
        };
        let cloud = CloudConfig {
            region: aws_region.clone(),
            throttle,
            vpc_id: aws_vpc_id.clone(),
            vpc_cache_duration: Duration::from_secs(aws_vpc_cache_duration.saturating_mul(60)),
            max_retries: *aws_max_retries,
        };

        Ok(Config {
            controller,
            cloud,
            reconcile_timeout: Duration::from_millis(*reconcile_timeout_ms),
        })
    }
}
