//! Build automation tasks for the pgloop workspace.
//!
//! Run with `cargo xtask <command>`.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

/// Crates published from this workspace, in dependency order.
const CRATES: &[&str] = &["pgloop-driver", "pgloop-testing", "pgloop-pool", "pgloop"];

#[derive(Parser)]
#[command(name = "xtask", about = "Build automation for pgloop")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all checks (format, lint, test, docs)
    Ci,
    /// Run cargo fmt --check
    Fmt,
    /// Run clippy on every target, denying warnings
    Clippy,
    /// Run tests
    Test {
        /// Only test this crate
        #[arg(short, long)]
        package: Option<String>,
        /// Cases per property test (sets PROPTEST_CASES)
        #[arg(long)]
        proptest_cases: Option<u32>,
    },
    /// Generate documentation
    Doc {
        /// Open the docs in a browser
        #[arg(long)]
        open: bool,
    },
    /// Clean build artifacts
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    let workspace_root = workspace_root()?;
    sh.change_dir(&workspace_root);

    match cli.command {
        Command::Ci => {
            println!("Running CI checks...");
            fmt(&sh)?;
            clippy(&sh)?;
            test(&sh, None, Some(512))?;
            doc(&sh, false)?;
            println!("All CI checks passed!");
        }
        Command::Fmt => fmt(&sh)?,
        Command::Clippy => clippy(&sh)?,
        Command::Test {
            package,
            proptest_cases,
        } => test(&sh, package.as_deref(), proptest_cases)?,
        Command::Doc { open } => doc(&sh, open)?,
        Command::Clean => clean(&sh)?,
    }

    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    let output = std::process::Command::new("cargo")
        .args(["locate-project", "--workspace", "--message-format=plain"])
        .output()
        .context("failed to run cargo locate-project")?;

    let path = String::from_utf8(output.stdout)
        .context("invalid UTF-8 in cargo output")?
        .trim()
        .to_string();

    Ok(PathBuf::from(path)
        .parent()
        .context("failed to get workspace root")?
        .to_path_buf())
}

fn fmt(sh: &Shell) -> Result<()> {
    println!("Checking formatting...");
    cmd!(sh, "cargo fmt --all -- --check").run()?;
    println!("Formatting check passed.");
    Ok(())
}

fn clippy(sh: &Shell) -> Result<()> {
    println!("Running clippy...");
    cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
    println!("Clippy check passed.");
    Ok(())
}

fn test(sh: &Shell, package: Option<&str>, proptest_cases: Option<u32>) -> Result<()> {
    let _cases = proptest_cases.map(|n| sh.push_env("PROPTEST_CASES", n.to_string()));

    match package {
        Some(package) => {
            if !CRATES.contains(&package) {
                bail!("unknown crate `{package}`, expected one of {CRATES:?}");
            }
            println!("Running tests for {package}...");
            cmd!(sh, "cargo test -p {package}").run()?;
        }
        None => {
            println!("Running tests...");
            cmd!(sh, "cargo test --workspace").run()?;
        }
    }
    println!("All tests passed.");
    Ok(())
}

fn doc(sh: &Shell, open: bool) -> Result<()> {
    println!("Generating documentation...");
    let open = open.then_some("--open");
    cmd!(sh, "cargo doc --workspace --no-deps {open...}").run()?;
    println!("Documentation generated.");
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("Cleaning build artifacts...");
    cmd!(sh, "cargo clean").run()?;
    println!("Clean complete.");
    Ok(())
}
