//! sifrun - HPC container launcher
//!
//! Thin command line front end over [`sifrun::Launcher`]. Parses flags into
//! one [`LaunchRequest`], installs logging, and makes the single exit
//! decision for the process.
//!
//! ## Usage
//!
//! ```sh
//! sifrun exec [options] <image> <command> [args...]
//! sifrun run [options] <image> [args...]
//! sifrun instance start [options] <image> <name> [args...]
//! sifrun instance list
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{Level, debug};
use tracing_subscriber::FmtSubscriber;

use sifrun::{
    CapabilityProbe, DriverRegistry, HostConfig, InstanceRequest, LaunchRequest, Launcher,
    MessageLevel, NamespaceRequest, TerminalPrompt,
};

/// Script run by `sifrun run` inside the container.
const RUNSCRIPT: &str = "/.singularity.d/runscript";

// =============================================================================
// CLI
// =============================================================================

/// Launch containers from SIF, squashfs and sandbox images
#[derive(Parser, Debug)]
#[command(name = "sifrun", author, version, about)]
struct Cli {
    /// Print informational messages
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// Print debugging messages
    #[arg(short, long, global = true, default_value_t = false)]
    debug: bool,

    /// Only print errors
    #[arg(short, long, global = true, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command inside a container
    Exec {
        #[command(flatten)]
        opts: LaunchOpts,
        /// Image path
        image: PathBuf,
        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Run the image's runscript
    Run {
        #[command(flatten)]
        opts: LaunchOpts,
        /// Image path
        image: PathBuf,
        /// Runscript arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Manage detached instances
    Instance {
        #[command(subcommand)]
        command: InstanceCommand,
    },
}

#[derive(Subcommand, Debug)]
enum InstanceCommand {
    /// Start a named instance
    Start {
        #[command(flatten)]
        opts: LaunchOpts,
        /// Write the instance pid to this file
        #[arg(long)]
        pid_file: Option<PathBuf>,
        /// Image path
        image: PathBuf,
        /// Instance name
        name: String,
        /// Arguments for the instance start script
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// List running instances
    List,
}

#[derive(Args, Debug, Default)]
struct LaunchOpts {
    /// Run in a user namespace without the setuid starter
    #[arg(short = 'u', long)]
    userns: bool,
    /// Run as root inside the container using subuid/subgid mappings
    #[arg(short = 'f', long)]
    fakeroot: bool,
    /// Boot the image's init
    #[arg(long)]
    boot: bool,
    /// Use minimal /dev and empty home, tmp directories
    #[arg(short = 'c', long)]
    contain: bool,
    /// Contain file systems, PID, IPC and environment
    #[arg(short = 'C', long)]
    containall: bool,
    /// Do not start an init process with --pid
    #[arg(long)]
    no_init: bool,
    /// Mount the sandbox read-write
    #[arg(short = 'w', long)]
    writable: bool,
    /// Overlay a tmpfs on the image
    #[arg(long)]
    writable_tmpfs: bool,
    /// Network namespace
    #[arg(short = 'n', long)]
    net: bool,
    /// UTS namespace
    #[arg(long)]
    uts: bool,
    /// PID namespace
    #[arg(short = 'p', long)]
    pid: bool,
    /// IPC namespace
    #[arg(short = 'i', long)]
    ipc: bool,
    /// Bind mount spec src[:dest[:ro|rw]], comma separated
    #[arg(short = 'B', long = "bind")]
    binds: Vec<String>,
    /// Capabilities to add
    #[arg(long)]
    add_caps: Option<String>,
    /// Capabilities to drop
    #[arg(long)]
    drop_caps: Option<String>,
    /// Enable NVIDIA support
    #[arg(long)]
    nv: bool,
    /// Use nvidia-container-cli for NVIDIA setup
    #[arg(long)]
    nvccli: bool,
    /// Disable NVIDIA support
    #[arg(long)]
    no_nv: bool,
    /// Enable ROCm support
    #[arg(long)]
    rocm: bool,
    /// Disable ROCm support
    #[arg(long)]
    no_rocm: bool,
    /// Home directory spec src[:dest]
    #[arg(short = 'H', long)]
    home: Option<String>,
    /// Do not mount the home directory
    #[arg(long)]
    no_home: bool,
    /// Working directory for --contain
    #[arg(short = 'W', long)]
    workdir: Option<PathBuf>,
    /// Initial working directory inside the container
    #[arg(long)]
    pwd: Option<PathBuf>,
    /// Environment variable KEY=VALUE
    #[arg(long)]
    env: Vec<String>,
    /// Security options, e.g. uid:1001,gid:1001
    #[arg(long)]
    security: Vec<String>,
    /// Cgroups resource limits file
    #[arg(long)]
    apply_cgroups: Option<PathBuf>,
    /// Do not propagate the umask
    #[arg(long)]
    no_umask: bool,
    /// PEM private key for an encrypted image
    #[arg(long)]
    pem_path: Option<PathBuf>,
    /// Prompt for an encryption passphrase
    #[arg(long)]
    passphrase: bool,
}

impl LaunchOpts {
    fn into_request(self, image: PathBuf, args: Vec<String>) -> LaunchRequest {
        LaunchRequest {
            image,
            args,
            instance: None,
            user_namespace: self.userns,
            fakeroot: self.fakeroot,
            boot: self.boot,
            contain: self.contain,
            containall: self.containall,
            no_init: self.no_init,
            writable: self.writable,
            writable_tmpfs: self.writable_tmpfs,
            namespaces: NamespaceRequest {
                net: self.net,
                uts: self.uts,
                pid: self.pid,
                ipc: self.ipc,
            },
            binds: self.binds,
            add_caps: self.add_caps,
            drop_caps: self.drop_caps,
            nv: self.nv && !self.no_nv,
            nvccli: self.nvccli && !self.no_nv,
            rocm: self.rocm && !self.no_rocm,
            home: self.home,
            no_home: self.no_home,
            workdir: self.workdir,
            pwd: self.pwd,
            env: self.env,
            host_env: std::env::vars().collect(),
            security: self.security,
            apply_cgroups: self.apply_cgroups,
            no_umask: self.no_umask,
            pem_path: self.pem_path,
            passphrase: self.passphrase,
        }
    }
}

impl Cli {
    fn message_level(&self) -> MessageLevel {
        if self.debug {
            MessageLevel::Debug
        } else if self.verbose {
            MessageLevel::Verbose
        } else if self.quiet {
            MessageLevel::Quiet
        } else {
            MessageLevel::Normal
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

fn cmd_launch(
    host: &HostConfig,
    probe: CapabilityProbe,
    level: MessageLevel,
    request: LaunchRequest,
) -> Result<()> {
    let drivers = DriverRegistry::new();
    let launcher =
        Launcher::new(host, probe, &drivers, &TerminalPrompt).with_message_level(level);
    debug!("caller: {}", launcher.probe());

    if request.instance.is_some() {
        let instance = launcher.start_instance(&request)?;
        println!(
            "instance {} started (pid {})",
            instance.name, instance.pid
        );
        return Ok(());
    }

    Err(launcher.exec(&request)).context("container launch failed")
}

fn cmd_instance_list(host: &HostConfig) -> Result<()> {
    let registry = sifrun::InstanceRegistry::new(host.instance_root());
    let instances = registry.list()?;
    println!("{:<24} {:>8}  {:<26} IMAGE", "NAME", "PID", "STARTED");
    for i in instances {
        println!(
            "{:<24} {:>8}  {:<26} {}",
            i.name,
            i.pid,
            i.created_at.format("%Y-%m-%dT%H:%M:%S%z"),
            i.image.display()
        );
    }
    Ok(())
}

fn run(cli: Cli, level: MessageLevel) -> Result<()> {
    let probe = CapabilityProbe::detect();
    let host = HostConfig::load(&probe).context("failed to load host configuration")?;

    match cli.command {
        Command::Exec {
            opts,
            image,
            command,
        } => cmd_launch(&host, probe, level, opts.into_request(image, command)),
        Command::Run { opts, image, args } => {
            let mut argv = vec![RUNSCRIPT.to_string()];
            argv.extend(args);
            cmd_launch(&host, probe, level, opts.into_request(image, argv))
        }
        Command::Instance {
            command:
                InstanceCommand::Start {
                    opts,
                    pid_file,
                    image,
                    name,
                    args,
                },
        } => {
            let mut request = opts.into_request(image, args);
            request.instance = Some(InstanceRequest { name, pid_file });
            cmd_launch(&host, probe, level, request)
        }
        Command::Instance {
            command: InstanceCommand::List,
        } => cmd_instance_list(&host),
    }
}

// =============================================================================
// Main
// =============================================================================

fn init_tracing(level: MessageLevel) {
    let max = match level {
        MessageLevel::Quiet => Level::ERROR,
        MessageLevel::Normal => Level::WARN,
        MessageLevel::Verbose => Level::INFO,
        MessageLevel::Debug => Level::DEBUG,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(max)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = cli.message_level();
    init_tracing(level);

    match run(cli, level) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("FATAL: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
