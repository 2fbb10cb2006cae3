use std::path::PathBuf;
use std::sync::Arc;

use block_balancer::cluster::HostSet;
use block_balancer::engine::ExitStatus;
use block_balancer::policy::PolicyKind;
use block_balancer::runner::{self, RunnerParams};
use block_balancer::service::connector::Connector;
use block_balancer::service::remote::RemoteNameService;
use block_balancer::service::{NameService, ServiceError};
use block_balancer::{signal, BalancerError, Config};
use clap::Parser;
use log::error;

#[derive(Parser, Debug)]
#[command(
    name = "balancer",
    about = "Rebalances byte occupancy across the storage nodes of a replicated block-storage cluster."
)]
struct BalancerCli {
    /// Utilization definition: node sums all storage types, pool keeps
    /// them apart.
    #[arg(long, value_enum, default_value = "node")]
    policy: PolicyKind,
    /// Percentage of deviation from the cluster mean a group may show
    /// before it takes part in balancing, in [1.0, 100.0].
    #[arg(long, default_value_t = 10.0)]
    threshold: f64,
    /// Hosts left out of balancing (comma separated host[:port] list).
    #[arg(long, value_delimiter = ',', conflicts_with_all = ["include", "include_file"])]
    exclude: Vec<String>,
    /// File with one excluded host per line.
    #[arg(long, conflicts_with_all = ["include", "include_file"])]
    exclude_file: Option<PathBuf>,
    /// Only these hosts take part in balancing.
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,
    /// File with one included host per line.
    #[arg(long)]
    include_file: Option<PathBuf>,
    /// TOML file with the runtime configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    signal::install();
    let code = match faux_main() {
        Ok(status) => status.code(),
        Err(e) => {
            eprintln!("{e}");
            match e {
                BalancerError::InvalidArguments(_) | BalancerError::ConfigParse { .. } => {
                    ExitStatus::IllegalArgs.code()
                }
                _ => ExitStatus::IoException.code(),
            }
        }
    };
    std::process::exit(code);
}

fn faux_main() -> Result<ExitStatus, BalancerError> {
    let args = match BalancerCli::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap already renders the usage text.
            let _ = e.print();
            return Ok(ExitStatus::IllegalArgs);
        }
    };
    if !(1.0..=100.0).contains(&args.threshold) {
        return Err(BalancerError::InvalidArguments(format!(
            "threshold {} is outside [1.0, 100.0]",
            args.threshold
        )));
    }

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if config.services.is_empty() {
        return Err(BalancerError::InvalidArguments(
            "no name services configured".to_string(),
        ));
    }

    let excluded = host_set(&args.exclude, args.exclude_file.as_ref())?;
    let included = host_set(&args.include, args.include_file.as_ref())?;

    let mut connectors = Vec::new();
    for endpoint in &config.services {
        let service: Arc<dyn NameService> =
            Arc::new(RemoteNameService::open(endpoint.endpoint.clone()));
        match Connector::connect(endpoint.name.clone(), service) {
            Ok(connector) => connectors.push(connector),
            Err(ServiceError::LockContention { path }) => {
                error!(
                    "{}: {path} is taken, another balancer is already running",
                    endpoint.name
                );
                for connector in &connectors {
                    connector.close();
                }
                return Ok(ExitStatus::AlreadyRunning);
            }
            Err(e) => {
                for connector in &connectors {
                    connector.close();
                }
                return Err(e.into());
            }
        }
    }

    let params = RunnerParams {
        policy: args.policy,
        threshold_pct: args.threshold,
        excluded,
        included,
    };
    Ok(runner::run(connectors, params, &config, signal::flag()))
}

fn host_set(list: &[String], file: Option<&PathBuf>) -> Result<HostSet, BalancerError> {
    let mut set = HostSet::new(list.iter().cloned());
    if let Some(path) = file {
        set.extend(HostSet::from_file(path)?);
    }
    Ok(set)
}
