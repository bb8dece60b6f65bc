// =============================================================================
// VK-INTEGRATE - Adaptive 2-D integration on a Vulkan compute queue
// =============================================================================
//
// RUN FLOW:
// 1. Parse arguments (integrand number, config file)
// 2. Load and validate the configuration
// 3. Read the integrand's SPIR-V kernel, create the Vulkan device
//    (or the in-process host device with --host)
// 4. Dispatch at doubling resolution until the error targets are met
// 5. Print result, absolute error, relative error and elapsed milliseconds
//
// Every failure travels back here and becomes the process exit code.
//
// =============================================================================

use clap::error::ErrorKind;
use clap::Parser;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use vk_integrate::backend::host::SPIRV_MAGIC;
use vk_integrate::backend::{shader, DeviceOptions, HostDevice, VulkanDevice};
use vk_integrate::{integrate, Config, Error, ExitStatus, Integrand, Outcome, Result};

#[derive(Debug, Parser)]
#[command(name = "vk-integrate", version, about)]
struct Cli {
    /// Integrand: 1 = De Jong's fifth, 2 = Ackley, 3 = Langermann
    function: u32,

    /// Configuration file with key=value lines
    config: PathBuf,

    /// Evaluate on the in-process host device instead of a GPU
    #[arg(long)]
    host: bool,

    /// Directory holding func<N>.comp.spv
    #[arg(long, default_value = "shaders")]
    shader_dir: PathBuf,

    /// Fail with a distinct exit code when the iteration cap is hit before
    /// either error target
    #[arg(long)]
    require_accuracy: bool,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitStatus::Success.into(),
                _ => ExitStatus::WrongArguments.into(),
            };
        }
    };

    let config = match Config::load_from_path(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            let error = Error::from(e);
            eprintln!("Error: {}", error);
            return error.exit_status().into();
        }
    };

    let logs_to_file = init_logging(cli.verbose, config.debug.log_file.as_deref());
    log::info!("Using configuration {:?}", cli.config);

    match run(&cli, &config) {
        Ok(outcome) => {
            println!("{}", outcome.result);
            println!("{}", outcome.abs_err);
            println!("{}", outcome.rel_err);
            println!("{}", outcome.elapsed.as_millis());
            ExitStatus::Success.into()
        }
        Err(e) => fail(&e, logs_to_file),
    }
}

/// Report a fatal error on stderr, and in the log file when one is in use
fn fail(error: &Error, logs_to_file: bool) -> ExitCode {
    if logs_to_file {
        log::error!("{:#}", error);
    }
    eprintln!("Error: {:#}", error);
    error.exit_status().into()
}

/// Initialize logging, optionally into a file instead of stderr. Returns
/// whether log records go to a file.
fn init_logging(verbose: bool, log_file: Option<&str>) -> bool {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let mut to_file = false;
    if let Some(path) = log_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== vk-integrate log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
                to_file = true;
            }
            Err(e) => eprintln!("Warning: cannot open log file {}: {}", path, e),
        }
    }

    builder.init();
    to_file
}

fn run(cli: &Cli, config: &Config) -> Result<Outcome> {
    let integrand = Integrand::from_index(cli.function)?;
    log::info!("Integrand {}: {}", integrand.index(), integrand.name());

    let outcome = if cli.host {
        // The host device runs the integrand directly; the module is only
        // checked for its header
        let device = HostDevice::new(integrand.host_kernel());
        integrate(&device, &[SPIRV_MAGIC], config)?
    } else {
        let code = shader::read_kernel(&integrand.kernel_path(&cli.shader_dir))?;
        let device = VulkanDevice::new(&DeviceOptions {
            app_name: "vk-integrate".to_string(),
            enable_validation: cfg!(debug_assertions) && config.debug.validation_layers,
            timeline_semaphores: config.gpu.timeline_semaphores,
        })?;
        integrate(&device, &code, config)?
    };

    if cli.require_accuracy && !outcome.converged {
        return Err(Error::AccuracyNotReached {
            iterations: outcome.iterations,
            abs_err: outcome.abs_err,
            rel_err: outcome.rel_err,
        });
    }
    Ok(outcome)
}
