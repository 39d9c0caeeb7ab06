//! The worker binary. Spawned by the control plane with the control channel
//! on fds 3/4 and the payload channel on fds 5/6, settings as `--key=value`
//! arguments, SIGINT/SIGTERM for orderly shutdown.

use std::os::unix::io::FromRawFd;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};

use sfu::settings::WorkerSettings;
use sfu::worker::Worker;

const CONSUMER_CHANNEL_FD: i32 = 3;
const PRODUCER_CHANNEL_FD: i32 = 4;
const CONSUMER_PAYLOAD_FD: i32 = 5;
const PRODUCER_PAYLOAD_FD: i32 = 6;

fn fd_file(fd: i32) -> tokio::fs::File {
    // The control plane owns these descriptors for the worker's lifetime.
    tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(fd) })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let settings = match WorkerSettings::from_args(std::env::args().skip(1)) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("invalid settings: {err}");
            return ExitCode::from(42);
        }
    };

    let control_reader = fd_file(CONSUMER_CHANNEL_FD);
    let control_writer = fd_file(PRODUCER_CHANNEL_FD);
    let payload_reader = fd_file(CONSUMER_PAYLOAD_FD);
    let payload_writer = fd_file(PRODUCER_PAYLOAD_FD);

    let worker = match Worker::new(settings, control_writer, payload_writer) {
        Ok(worker) => worker,
        Err(err) => {
            eprintln!("cannot create worker: {err}");
            return ExitCode::FAILURE;
        }
    };

    if log::set_boxed_logger(Box::new(worker.logger())).is_ok() {
        log::set_max_level(log::LevelFilter::Debug);
    }

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("cannot install SIGINT handler: {err}");
            return ExitCode::FAILURE;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("cannot install SIGTERM handler: {err}");
            return ExitCode::FAILURE;
        }
    };

    {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {
                    log::debug!("INT signal received, closing myself");
                }
                _ = sigterm.recv() => {
                    log::debug!("TERM signal received, closing myself");
                }
            }
            worker.close().await;
        });
    }

    // PIPE, HUP, ALRM, USR1 and USR2 are ignored: a dead supervisor is
    // detected through the channel, not through signals.
    for kind in [
        SignalKind::pipe(),
        SignalKind::hangup(),
        SignalKind::alarm(),
        SignalKind::user_defined1(),
        SignalKind::user_defined2(),
    ] {
        if let Ok(mut sig) = signal(kind) {
            tokio::spawn(async move {
                loop {
                    if sig.recv().await.is_none() {
                        return;
                    }
                }
            });
        }
    }

    if let Err(err) = worker.run(control_reader, payload_reader).await {
        log::error!("worker failed: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
