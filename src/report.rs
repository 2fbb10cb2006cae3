use std::fs::File;
use std::path::Path;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use human_repr::HumanDuration;
use indicatif::HumanBytes;

/// This module collects per-iteration figures from the engines and
/// renders the progress table on stdout. When a report directory is
/// configured the same rows are mirrored into a CSV file with raw byte
/// counts.

pub enum ReportMsg {
    Iteration {
        service: String,
        iteration: usize,
        bytes_moved: u64,
        bytes_left: u64,
        bytes_this_iteration: u64,
    },
    Balanced {
        service: String,
    },
    Summary {
        elapsed: Duration,
    },
    Done,
}

pub struct ReportCollector {
    rx: Receiver<ReportMsg>,
    csv: Option<csv::Writer<File>>,
}

impl ReportCollector {
    pub fn new(path: Option<&Path>) -> Result<(Self, Sender<ReportMsg>), std::io::Error> {
        let csv = match path {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let writer = csv::Writer::from_path(dir.join("iterations.csv"))
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                Some(writer)
            }
            None => None,
        };
        let (tx, rx) = crossbeam::channel::unbounded();
        Ok((Self { rx, csv }, tx))
    }

    pub fn main(mut self) -> Result<(), std::io::Error> {
        println!(
            "{:<24} {:>10} {:>18} {:>18} {:>18}",
            "Time Stamp", "Iteration#", "Bytes Moved", "Bytes Left", "Bytes This Iter"
        );
        if let Some(writer) = &mut self.csv {
            writer
                .write_record([
                    "timestamp",
                    "service",
                    "iteration",
                    "bytes_moved",
                    "bytes_left",
                    "bytes_this_iteration",
                ])
                .map_err(csv_err)?;
        }

        while let Ok(msg) = self.rx.recv() {
            match msg {
                ReportMsg::Iteration {
                    service,
                    iteration,
                    bytes_moved,
                    bytes_left,
                    bytes_this_iteration,
                } => {
                    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
                    println!(
                        "{:<24} {:>10} {:>18} {:>18} {:>18}",
                        stamp,
                        iteration,
                        HumanBytes(bytes_moved).to_string(),
                        HumanBytes(bytes_left).to_string(),
                        HumanBytes(bytes_this_iteration).to_string(),
                    );
                    if let Some(writer) = &mut self.csv {
                        writer
                            .write_record([
                                stamp,
                                service,
                                iteration.to_string(),
                                bytes_moved.to_string(),
                                bytes_left.to_string(),
                                bytes_this_iteration.to_string(),
                            ])
                            .map_err(csv_err)?;
                    }
                }
                ReportMsg::Balanced { service } => {
                    println!("The cluster is balanced. Exiting... ({service})");
                }
                ReportMsg::Summary { elapsed } => {
                    println!("Balancing took {}", elapsed.human_duration());
                }
                ReportMsg::Done => break,
            }
        }
        if let Some(writer) = &mut self.csv {
            writer.flush()?;
        }
        Ok(())
    }
}

fn csv_err(e: csv::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e)
}
