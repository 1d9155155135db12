use clap::Parser;
use pitboss::cli::Cli;
use pitboss::config::{AppConfig, LoggingConfig};
use pitboss::coordination::install_signal_handlers;
use pitboss::error::PitbossError;
use pitboss::pipeline::{Pipeline, PipelineOptions};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match AppConfig::load_from(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            init_fallback_logging();
            let err = PitbossError::from(e);
            error!(error = %err, config_dir = %cli.config, "could not load configuration");
            std::process::exit(err.exit_code());
        }
    };
    init_logging(&config.logging, &config.paths.log_dir);

    info!(
        mode = %cli.mode,
        config_dir = %cli.config,
        services = config.services.len(),
        "pitboss starting"
    );

    // Report every config problem at once; operators should not fix them
    // one failed run at a time
    if let Err(problems) = config.validate() {
        for problem in &problems {
            error!(problem = %problem, "configuration invalid");
        }
        let err = PitbossError::InvalidConfig(problems.join("; "));
        std::process::exit(err.exit_code());
    }

    let mut pipeline = Pipeline::new(config, PipelineOptions::from_cli(&cli));

    if let Err(e) = install_signal_handlers(&pipeline.coordinator()) {
        error!(error = %e, "could not install signal handlers");
        std::process::exit(e.exit_code());
    }

    if let Err(err) = pipeline.run().await {
        if matches!(err, PitbossError::Interrupted) {
            warn!("interrupted by signal before services were up");
        }
        std::process::exit(err.exit_code());
    }
}

/// Console logging plus a daily-rolling `pitboss.log` under the configured
/// log directory, next to the service logs.
fn init_logging(config: &LoggingConfig, log_dir: &std::path::Path) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},pitboss=debug", config.level)));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer().json())
            .with(try_file_layer(log_dir))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer())
            .with(try_file_layer(log_dir))
            .init();
    }
}

fn console_layer<S>() -> tracing_subscriber::fmt::Layer<S> {
    tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
}

/// Rolling file layer, or None when the directory is not writable. The
/// writability probe matters: with `panic = "abort"` a rolling appender
/// that cannot create its first file would take the whole process down.
fn try_file_layer<S>(log_dir: &std::path::Path) -> Option<Box<dyn tracing_subscriber::Layer<S> + Send + Sync>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    use tracing_subscriber::Layer;

    if std::fs::create_dir_all(log_dir).is_err() {
        eprintln!(
            "file logging disabled: cannot create {}",
            log_dir.display()
        );
        return None;
    }
    let probe = log_dir.join(".pitboss_write_test");
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
        }
        Err(e) => {
            eprintln!(
                "file logging disabled: cannot write to {}: {e}",
                log_dir.display()
            );
            return None;
        }
    }

    let appender = tracing_appender::rolling::daily(log_dir, "pitboss.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    // The worker guard must live as long as the process
    Box::leak(Box::new(guard));

    Some(
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed(),
    )
}

/// Minimal subscriber for errors that happen before the config is readable
fn init_fallback_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info"))
        .try_init();
}
