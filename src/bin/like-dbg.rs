use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use like_dbg::artifact::Curl;
use like_dbg::cancel::{install_interrupt_handler, Cancellation};
use like_dbg::config::sections::LabConfig;
use like_dbg::config::Config;
use like_dbg::docker::{teardown_matching, DockerCli, TAG_PREFIX};
use like_dbg::error::{exit_code_for, is_interrupted};
use like_dbg::pipeline::{Pipeline, PipelineOutcome, RunOptions, Services, Stage};
use like_dbg::preflight::{check_host_tools, check_required_tools, CONTAINER_TOOLS};
use like_dbg::remote::{SshShell, SSH_KEY_NAME};
use like_dbg::reuse::StdinPrompt;
use like_dbg::session::CtfInputs;
use like_dbg::tmux::{require_tmux, TmuxCli};

/// Disposable Linux kernel debugging lab
#[derive(Parser)]
#[command(name = "like-dbg")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Debug a supplied kernel image and root filesystem instead of building them
    #[arg(long, num_args = 2, value_names = ["KERNEL", "ROOTFS"])]
    ctf: Option<Vec<PathBuf>>,

    /// Stop after this stage (download, unpack, build-kernel, rootfs, debug)
    #[arg(long, value_name = "STAGE")]
    dry_run: Option<Stage>,

    /// Start at this stage, assuming earlier stages already ran
    #[arg(long, value_name = "STAGE")]
    partial: Option<Stage>,

    /// Rebuild every container image without cache, then exit
    #[arg(long)]
    update_containers: bool,

    /// Stop every running lab container, then exit
    #[arg(long)]
    kill: bool,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,

    /// Extra configuration file applied on top of configs/
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Re-use existing artifacts without asking
    #[arg(short = 'y', long)]
    yes: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            let interrupted = is_interrupted(&e) || Cancellation::process().is_cancelled();
            if interrupted {
                stop_lab_containers(&DockerCli::new());
                return ExitCode::from(130);
            }
            ExitCode::from(u8::try_from(exit_code_for(&e)).unwrap_or(1))
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    install_interrupt_handler()?;

    let engine = DockerCli::new();
    if cli.kill {
        check_required_tools(CONTAINER_TOOLS)?;
        stop_lab_containers(&engine);
        return Ok(());
    }

    let ctf = match cli.ctf.as_deref() {
        Some([kernel, rootfs]) => Some(CtfInputs::new(kernel, rootfs)?),
        _ => None,
    };
    let opts = RunOptions {
        dry_run: cli.dry_run,
        partial: cli.partial,
        ctf,
        update: cli.update_containers,
        skip_prompts: cli.yes,
        verbose: cli.verbose,
    };
    opts.validate()?;
    check_host_tools(opts.needs_tmux())?;
    if opts.needs_tmux() {
        require_tmux()?;
    }

    let project_dir = std::env::current_dir().context("resolving project directory")?;
    let config = Config::load(&project_dir, cli.config.as_deref())?;
    let lab = LabConfig::from_config(&config)?;
    tracing::debug!("resolved configuration: {:?}", lab);

    let key = project_dir.join(&lab.general.ssh_dir).join(SSH_KEY_NAME);
    let shell = SshShell::new(&lab.general.user, lab.general.ssh_fwd_port, &key);
    let services = Services {
        engine: &engine,
        prompt: &StdinPrompt,
        fetch: &Curl,
        tmux: &TmuxCli,
        shell: &shell,
        cancel: Cancellation::process(),
    };

    match Pipeline::new(&lab, &project_dir, opts, services).run()? {
        PipelineOutcome::Completed(result) => {
            tracing::info!("lab is up, kernel tree {}", result.kernel_root.display());
        }
        PipelineOutcome::StoppedAfter(stage, _) => {
            tracing::info!("dry run finished after {}", stage);
        }
        PipelineOutcome::ContainersUpdated => tracing::info!("container images updated"),
        PipelineOutcome::CtfSessionStarted => tracing::info!("CTF session is up"),
    }
    Ok(())
}

fn stop_lab_containers(engine: &DockerCli) {
    match teardown_matching(engine, TAG_PREFIX) {
        Ok(report) if report.failed.is_empty() => {
            tracing::info!("stopped {} lab container(s)", report.stopped.len());
        }
        Ok(report) => tracing::warn!(
            "stopped {} lab container(s), {} refused: {}",
            report.stopped.len(),
            report.failed.len(),
            report.failed.join(", ")
        ),
        Err(e) => tracing::warn!("listing lab containers failed: {:#}", e),
    }
}
