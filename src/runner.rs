use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use indicatif::HumanBytes;
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::cluster::HostSet;
use crate::config::Config;
use crate::engine::{Engine, ExitStatus, WorkerPool};
use crate::policy::PolicyKind;
use crate::report::{ReportCollector, ReportMsg};
use crate::service::connector::Connector;

/// What the CLI hands to the runner.
pub struct RunnerParams {
    pub policy: PolicyKind,
    pub threshold_pct: f64,
    pub excluded: HostSet,
    pub included: HostSet,
}

/// Sweep every name service, shuffled, once per round; sleep two
/// heartbeats between rounds; stop when all services are balanced or any
/// of them fails terminally. Pools and connectors are torn down on every
/// exit path.
pub fn run(
    connectors: Vec<Arc<Connector>>,
    params: RunnerParams,
    config: &Config,
    interrupted: Arc<AtomicBool>,
) -> ExitStatus {
    let start = Instant::now();
    let dispatcher_pool = WorkerPool::new("dispatcher", config.dispatcher_threads);
    let mover_pool = WorkerPool::new("mover", config.mover_threads);

    let (collector, report) = match ReportCollector::new(config.report_path.as_deref()) {
        Ok(pair) => pair,
        Err(e) => {
            error!("cannot set up the report output: {e}");
            for connector in &connectors {
                connector.close();
            }
            dispatcher_pool.join();
            mover_pool.join();
            return ExitStatus::IoException;
        }
    };
    let report_thread = std::thread::spawn(move || collector.main());

    info!(
        "starting with {} name service(s), dispatcher threads {}, mover threads {}, \
         bandwidth cap {}/s per peer",
        connectors.len(),
        config.dispatcher_threads,
        config.mover_threads,
        HumanBytes(config.bandwidth_per_move),
    );

    let mut engines: Vec<Engine> = connectors
        .iter()
        .map(|connector| {
            Engine::new(
                connector.clone(),
                params.policy,
                params.threshold_pct,
                params.excluded.clone(),
                params.included.clone(),
                config,
                dispatcher_pool.handle(),
                mover_pool.handle(),
                interrupted.clone(),
            )
        })
        .collect();

    let mut rng = StdRng::from_entropy();
    let mut status = ExitStatus::Success;
    let mut iteration = 0usize;
    'rounds: loop {
        if interrupted.load(Ordering::SeqCst) {
            status = ExitStatus::Interrupted;
            break;
        }
        let mut done = true;
        engines.shuffle(&mut rng);
        for engine in engines.iter_mut() {
            let service = engine.connector().name().to_string();
            let result = engine.run_once();
            match result.status {
                ExitStatus::Success => {
                    let _ = report.send(ReportMsg::Balanced { service });
                }
                ExitStatus::InProgress => {
                    done = false;
                    let _ = report.send(ReportMsg::Iteration {
                        service,
                        iteration,
                        bytes_moved: engine.connector().bytes_moved(),
                        bytes_left: result.bytes_left,
                        bytes_this_iteration: result.bytes_moved_iteration,
                    });
                }
                terminal => {
                    warn!("{service}: {}", terminal.describe());
                    status = terminal;
                    break 'rounds;
                }
            }
        }
        if done {
            status = ExitStatus::Success;
            break;
        }
        iteration += 1;
        std::thread::sleep(2 * config.heartbeat_interval);
    }

    for connector in &connectors {
        connector.close();
    }
    let _ = report.send(ReportMsg::Summary {
        elapsed: start.elapsed(),
    });
    let _ = report.send(ReportMsg::Done);
    drop(report);
    if let Ok(Err(e)) = report_thread.join() {
        warn!("report collector failed: {e}");
    }

    // The engines hold the pool handles; they have to go before a join
    // can finish. An interrupted run abandons in-flight movers instead of
    // waiting out their socket timeouts.
    drop(engines);
    if status == ExitStatus::Interrupted {
        dispatcher_pool.abandon();
        mover_pool.abandon();
    } else {
        dispatcher_pool.join();
        mover_pool.join();
    }
    status
}
