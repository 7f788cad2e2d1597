use std::{path::PathBuf, process, sync::Arc};

use fedhub::{
    numeric::NumericHandler,
    server,
    session::SessionHandler,
    settings::Settings,
};
use futures::future::{self, Either};
use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::*;

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "fedhub")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        codec: codec_settings,
        aggregation: aggregation_settings,
        session: session_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let numeric = match api_settings.numeric_address {
        Some(addr) => {
            let listener = server::bind(addr).await.unwrap_or_else(|err| {
                error!("failed to bind the numeric listener to {}: {}", addr, err);
                process::exit(1);
            });
            info!("numeric protocol: {:?} policy", aggregation_settings.policy);
            let handler = NumericHandler::new(&aggregation_settings, &codec_settings);
            Either::Left(server::serve(listener, Arc::new(handler)))
        }
        None => Either::Right(future::pending::<()>()),
    };

    let session = match api_settings.session_address {
        Some(addr) => {
            let listener = server::bind(addr).await.unwrap_or_else(|err| {
                error!("failed to bind the session listener to {}: {}", addr, err);
                process::exit(1);
            });
            let handler = SessionHandler::from_settings(&session_settings, &codec_settings)
                .await
                .unwrap_or_else(|err| {
                    error!("failed to load the client records: {:#}", err);
                    process::exit(1);
                });
            Either::Left(server::serve(listener, Arc::new(handler)))
        }
        None => Either::Right(future::pending::<()>()),
    };

    tokio::select! {
        _ = numeric => {
            warn!("shutting down: numeric server terminated");
        }
        _ = session => {
            warn!("shutting down: session server terminated");
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
