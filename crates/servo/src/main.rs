use std::{env, ffi::OsString, os::unix::process::CommandExt, process};

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use servo::{request_stop, Agent, Config, Opts, StopMode};

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    init_tracing(opts.verbose);

    let config = match Config::resolve(opts) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            process::exit(1);
        }
    };

    // Captured before anything mutates the environment; a restart must
    // re-execute with exactly what we were started with.
    let argv: Vec<OsString> = env::args_os().collect();

    spawn_stop_listeners();

    let mut agent = Agent::new(config);
    if let Err(err) = agent.hello().await {
        error!("{err}");
        process::exit(1);
    }

    // SIGTERM/SIGINT take the immediate path: drop the in-flight loop,
    // say goodbye, exit. SIGUSR1/SIGHUP drain through the loop instead.
    let outcome = tokio::select! {
        result = agent.run() => Some(result),
        _ = interrupt() => {
            info!("interrupted; shutting down");
            None
        }
    };

    agent.goodbye().await;

    match outcome {
        None | Some(Ok(StopMode::Exit)) => process::exit(0),
        Some(Ok(StopMode::Restart)) => restart(argv),
        Some(Err(err)) => {
            error!("{err}");
            process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "servo=debug" } else { "servo=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Watches the graceful-stop signals and records the request for the
/// command loop. Handlers do nothing but flip the flag; all posting
/// happens on the main task.
fn spawn_stop_listeners() {
    let listeners = [
        (SignalKind::user_defined1(), StopMode::Exit),
        (SignalKind::hangup(), StopMode::Restart),
    ];
    for (kind, mode) in listeners {
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    while stream.recv().await.is_some() {
                        info!(?mode, "stop signal received");
                        request_stop(mode);
                    }
                });
            }
            Err(err) => warn!(%err, ?mode, "could not install stop signal handler"),
        }
    }
}

/// Resolves when SIGTERM or SIGINT arrives.
async fn interrupt() {
    let wait = |kind: SignalKind| async move {
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(%err, "could not install termination handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = wait(SignalKind::terminate()) => {}
        _ = wait(SignalKind::interrupt()) => {}
    }
}

/// Replaces the process image with a fresh copy of ourselves, preserving
/// the original argument vector.
fn restart(argv: Vec<OsString>) -> ! {
    info!("restarting with the original arguments");
    let mut argv = argv.into_iter();
    let program = argv.next().unwrap_or_else(|| OsString::from("servo"));
    let err = process::Command::new(program).args(argv).exec();
    error!(%err, "failed to re-execute");
    process::exit(1);
}
