use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use scanout::{cli::Cli, scheduler::StopHandle, Config, RunOptions};

fn main() -> ExitCode {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("info")
            .compact()
            .init();
    }

    #[cfg(feature = "profile-with-tracy")]
    profiling::tracy_client::Client::start();

    profiling::register_thread!("Main Thread");

    #[cfg(feature = "profile-with-puffin")]
    let _server = puffin_http::Server::new(&format!("0.0.0.0:{}", puffin_http::DEFAULT_PORT));
    #[cfg(feature = "profile-with-puffin")]
    profiling::puffin::set_scopes_on(true);

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load();
    cli.apply(&mut config);

    if cli.probe {
        tracing::info!("Probing available displays and resolutions");
        let lines = scanout::pipeline::probe(config.display.device.as_deref())
            .context("failed to probe displays")?;
        for line in lines {
            println!("{line}");
        }
        return Ok(());
    }

    let options = RunOptions::from_config(&config).context("invalid configuration")?;
    let stats = scanout::pipeline::execute(&options, StopHandle::default())
        .context("display pipeline failed")?;

    if stats.interrupted {
        tracing::info!("stopped by user after {} frames", stats.rendered);
    }
    tracing::info!(
        rendered = stats.rendered,
        presented = stats.presented,
        retired = stats.retired,
        busy_retries = stats.busy_retries,
        max_latency = ?stats.max_latency,
        max_frametime = ?stats.max_frametime,
        "{:.1} fps over {:.2?}",
        stats.fps,
        stats.elapsed
    );
    Ok(())
}
