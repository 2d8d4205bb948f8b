//! Implementation of the `run` command.

use crate::{config::LargoConfig, http::Api, wiring::AllInOne, Error};
use observability_deps::tracing::info;
use std::{convert::Infallible, net::SocketAddr, path::PathBuf};

/// Which components this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum)]
pub enum Mode {
    /// Every component in one process, in-process wiring, no gossip.
    All,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "run",
    about = "Runs largo server components",
    long_about = "Run largo.\n\nConfiguration is loaded from the YAML file given with \
    --config-file; command line flags and environment variables override it."
)]
pub struct Config {
    /// Server mode. Scattered modes require the external gossip and RPC
    /// transports and are not part of this build.
    #[clap(arg_enum, default_value = "all", action)]
    pub mode: Mode,

    /// Path to the YAML configuration file.
    #[clap(long = "--config-file", env = "LARGO_CONFIG_FILE", action)]
    pub config_file: Option<PathBuf>,

    /// Override the HTTP bind address.
    #[clap(long = "--http-bind", env = "LARGO_HTTP_BIND", action)]
    pub http_bind: Option<String>,
}

pub async fn command(config: Config) -> Result<(), Error> {
    let mut largo_config = LargoConfig::load(config.config_file.as_deref())?;
    if let Some(bind) = config.http_bind {
        largo_config.http_bind = bind;
    }

    let addr: SocketAddr = largo_config
        .http_bind
        .parse()
        .map_err(|_| Error::BadBindAddress {
            addr: largo_config.http_bind.clone(),
        })?;

    let all = AllInOne::build(&largo_config)?;
    let api = Api::new(&all);

    let make_service = hyper::service::make_service_fn(move |_conn| {
        let api = api.clone();
        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req| {
                let api = api.clone();
                async move { Ok::<_, Infallible>(api.handle(req).await) }
            }))
        }
    });

    info!(%addr, "largo listening");
    let server = hyper::Server::bind(&addr).serve(make_service);
    let graceful = server.with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    });

    graceful.await.map_err(|source| Error::Serve { source })?;
    all.shutdown().await;
    info!("largo stopped");
    Ok(())
}
