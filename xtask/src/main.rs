//! Build automation for the Muon kernel.
//!
//! Usage:
//!   cargo xtask check    - Type-check the kernel for the bare-metal target
//!   cargo xtask test     - Run the host-side unit tests
//!   cargo xtask ktest    - Build the kernel with the in-kernel test harness
//!   cargo xtask clippy   - Run clippy lints on every crate
//!   cargo xtask doc      - Generate documentation

use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

/// The bare-metal target the kernel ships on.
const KERNEL_TARGET: &str = "x86_64-unknown-none";

/// Crates that build and test on the host.
const HOST_CRATES: &[&str] = &["muon-core", "muon-kernel"];

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation for the Muon kernel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Type-check the kernel for the bare-metal target (and the host)
    Check {
        /// Target triple (default: x86_64-unknown-none)
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Run the host-side unit tests
    Test {
        /// Package to test (default: all host crates)
        #[arg(short, long)]
        package: Option<String>,

        /// Extra arguments passed after -- (forwarded to the test binary)
        #[arg(last = true)]
        extra_args: Vec<String>,
    },

    /// Build the kernel with the in-kernel test harness (--cfg ktest)
    Ktest {
        /// Build in release mode
        #[arg(short, long)]
        release: bool,
    },

    /// Run clippy lints on every crate
    Clippy,

    /// Generate documentation
    Doc {
        /// Open the docs in a browser when done
        #[arg(long)]
        open: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Check { target } => check(target.as_deref().unwrap_or(KERNEL_TARGET)),
        Commands::Test {
            package,
            extra_args,
        } => test(package.as_deref(), &extra_args),
        Commands::Ktest { release } => ktest(release),
        Commands::Clippy => clippy(),
        Commands::Doc { open } => doc(open),
    }
}

/// Runs a cargo subcommand, failing loudly on a non-zero exit.
fn run_cargo(args: &[&str], env: &[(&str, &str)]) -> Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.args(args);
    for (key, value) in env {
        cmd.env(key, value);
    }
    let status = cmd
        .status()
        .with_context(|| format!("running cargo {}", args.join(" ")))?;
    if !status.success() {
        bail!("cargo {} failed with {status}", args.join(" "));
    }
    Ok(())
}

fn check(target: &str) -> Result<()> {
    // Bare-metal first: this is the configuration that ships.
    run_cargo(
        &["check", "--package", "muon-kernel", "--target", target],
        &[],
    )?;
    // Then the host configuration the unit tests build under.
    for package in HOST_CRATES {
        run_cargo(&["check", "--package", package], &[])?;
    }
    Ok(())
}

fn test(package: Option<&str>, extra_args: &[String]) -> Result<()> {
    let packages: Vec<&str> = match package {
        Some(name) => vec![name],
        None => HOST_CRATES.to_vec(),
    };
    for package in packages {
        let mut args = vec!["test", "--package", package];
        if !extra_args.is_empty() {
            args.push("--");
            args.extend(extra_args.iter().map(String::as_str));
        }
        run_cargo(&args, &[])?;
    }
    Ok(())
}

fn ktest(release: bool) -> Result<()> {
    let mut args = vec![
        "build",
        "--package",
        "muon-kernel",
        "--target",
        KERNEL_TARGET,
    ];
    if release {
        args.push("--release");
    }
    run_cargo(&args, &[("RUSTFLAGS", "--cfg ktest")])
}

fn clippy() -> Result<()> {
    run_cargo(&["clippy", "--workspace", "--", "-D", "warnings"], &[])
}

fn doc(open: bool) -> Result<()> {
    let mut args = vec!["doc", "--workspace", "--no-deps"];
    if open {
        args.push("--open");
    }
    run_cargo(&args, &[])
}
