//! swiftmount entry point

use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use swiftmount::cli::{Cli, Command, MountArgs};
use swiftmount::config::{ConfigFile, MountConfig};
use swiftmount::diag::Diagnostics;
use swiftmount::env::EnvOverlay;
use swiftmount::gateway::{FuseGateway, MountGateway, MountHandle};
use swiftmount::lifecycle::Supervisor;
use swiftmount::options::mount_options;
use swiftmount::volume::SwiftVolume;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Mount(args) => mount(args),
    }
}

fn mount(args: MountArgs) -> ExitCode {
    init_logging(args.debug);

    // The config file is one layer of many; a missing or broken file
    // degrades resolution to the remaining layers.
    let file = load_config_file(&args);
    let overlay = EnvOverlay::capture();

    let config = match MountConfig::resolve(&args, file.as_ref(), &overlay)
        .and_then(MountConfig::normalized)
    {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration rejected");
            return ExitCode::from(err.exit_code());
        }
    };

    let credentials = match config.credentials() {
        Ok(credentials) => credentials,
        Err(err) => {
            error!(error = %err, "configuration rejected");
            return ExitCode::from(err.exit_code());
        }
    };

    let options = mount_options(&config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "runtime startup failed");
            return ExitCode::FAILURE;
        }
    };

    let mut supervisor = Supervisor::new(FuseGateway, config.mountpoint.clone(), options);

    // Diagnostics attach before the mount sequence; the scope guard
    // stops the profiler and harvests the endpoint on every exit path.
    let diagnostics = match Diagnostics::start(&config, supervisor.board(), runtime.handle()) {
        Ok(diagnostics) => diagnostics,
        Err(err) => {
            error!(error = %err, "diagnostics startup failed");
            return ExitCode::from(err.exit_code());
        }
    };
    let mut diagnostics = scopeguard::guard(diagnostics, |mut diagnostics| {
        diagnostics.shutdown();
    });

    let volume = match SwiftVolume::new(&config, credentials, runtime.handle().clone()) {
        Ok(volume) => volume,
        Err(err) => {
            error!(error = %err, "volume setup failed");
            return ExitCode::FAILURE;
        }
    };

    let handle = match supervisor.run(volume, &mut *diagnostics) {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "mount failed");
            return ExitCode::from(err.exit_code());
        }
    };

    info!(
        device = %config.device,
        mountpoint = ?config.mountpoint,
        "serving; interrupt or unmount externally to stop"
    );

    let mountpoint = config.mountpoint.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        info!("termination signal received");
        if let Err(err) = FuseGateway.unmount(&mountpoint) {
            warn!(error = %err, "unmount on signal failed");
        }
    }) {
        warn!(error = %err, "could not install signal handler");
    }

    // Steady state: control stays with the dispatch loop until the OS
    // unmounts the path or a signal triggers the handler above.
    match handle.join() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "dispatch ended with error");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config_file(args: &MountArgs) -> Option<ConfigFile> {
    let explicit = args.config.is_some();
    let path = args.config.clone().or_else(ConfigFile::default_path)?;
    match ConfigFile::load(&path) {
        Ok(file) => {
            debug!(path = %path.display(), "configuration file loaded");
            Some(file)
        }
        Err(err) if err.is_absent() && !explicit => {
            debug!(path = %path.display(), "no configuration file");
            None
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "configuration file skipped");
            None
        }
    }
}
