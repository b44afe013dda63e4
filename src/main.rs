use std::io::{self, BufRead};
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::sync::mpsc::error::TryRecvError;

use gyro_shaker::cli::Args;
use gyro_shaker::session::Session;

const STATUS_INTERVAL: Duration = Duration::from_secs(1);
const INPUT_POLL: Duration = Duration::from_millis(50);

fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=gyro_shaker=debug cargo run -- --simulate
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.dump_params {
        println!("{}", args.params_json()?);
        return Ok(());
    }
    let session = Session::from_args(&args)?;

    info!("Waiting for {:?}. Type 'q' + Enter to quit.", session.device_name());

    // ── Stdin reader ──────────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread so the status loop never blocks
    // on the terminal.  The sender is dropped at EOF.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // ── Status loop ───────────────────────────────────────────────────────────
    let mut next_status = Instant::now();
    loop {
        match line_rx.try_recv() {
            Ok(line) if line == "q" => {
                info!("Quit requested.");
                break;
            }
            Ok(_) | Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                info!("stdin closed – exiting.");
                break;
            }
        }

        if Instant::now() >= next_status {
            println!("{}", session.status_line());
            next_status += STATUS_INTERVAL;
        }
        std::thread::sleep(INPUT_POLL);
    }

    session.shutdown();
    Ok(())
}
