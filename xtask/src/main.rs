//! Build automation tasks for the tds-bridge workspace.
//!
//! Run with `cargo xtask <command>`.
//!
//! ## Available Commands
//!
//! - `ci`: Run all CI checks (format, lint, test)
//! - `fmt`: Check/apply code formatting
//! - `clippy`: Run clippy lints
//! - `test`: Run all tests
//! - `doc`: Generate documentation
//! - `bench`: Run benchmarks
//! - `fuzz`: Run fuzz tests (requires cargo-fuzz + nightly)
//! - `bridge`: Run the example bridge against a backend
//! - `clean`: Clean build artifacts

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

#[derive(Parser)]
#[command(name = "xtask", about = "Build automation for tds-bridge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all checks (format, lint, test)
    Ci,
    /// Run cargo fmt (--check by default, --fix to apply)
    Fmt {
        /// Apply formatting fixes
        #[arg(long)]
        fix: bool,
    },
    /// Run clippy on all targets
    Clippy {
        /// Apply clippy suggestions
        #[arg(long)]
        fix: bool,
    },
    /// Run all tests
    Test {
        /// Test a specific package
        #[arg(short, long)]
        package: Option<String>,
    },
    /// Generate documentation
    Doc {
        /// Open documentation in browser
        #[arg(long)]
        open: bool,
    },
    /// Run benchmarks
    Bench {
        /// Benchmark filter pattern
        filter: Option<String>,
    },
    /// Run fuzz tests (requires cargo-fuzz + nightly)
    Fuzz {
        /// Fuzz target to run
        #[arg(default_value = "parse_header")]
        target: String,
        /// Maximum runtime in seconds
        #[arg(long, default_value = "60")]
        max_time: u64,
        /// List available fuzz targets
        #[arg(long)]
        list: bool,
    },
    /// Run the example bridge
    Bridge {
        /// Backend address (host:port)
        backend: String,
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:14330")]
        listen: String,
        /// Poll the backend instead of waiting on reads
        #[arg(long)]
        polling: bool,
    },
    /// Clean build artifacts
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // Change to workspace root
    let workspace_root = workspace_root()?;
    sh.change_dir(&workspace_root);

    match cli.command {
        Command::Ci => {
            println!("Running CI checks...");
            fmt(&sh, false)?;
            clippy(&sh, false)?;
            test(&sh, None)?;
            println!("\n✅ All CI checks passed!");
        }
        Command::Fmt { fix } => fmt(&sh, fix)?,
        Command::Clippy { fix } => clippy(&sh, fix)?,
        Command::Test { package } => test(&sh, package.as_deref())?,
        Command::Doc { open } => doc(&sh, open)?,
        Command::Bench { filter } => bench(&sh, filter.as_deref())?,
        Command::Fuzz {
            target,
            max_time,
            list,
        } => fuzz(&sh, &target, max_time, list)?,
        Command::Bridge {
            backend,
            listen,
            polling,
        } => bridge(&sh, &backend, &listen, polling)?,
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

fn fmt(sh: &Shell, fix: bool) -> Result<()> {
    if fix {
        println!("Applying formatting...");
        cmd!(sh, "cargo fmt --all").run()?;
        println!("✅ Formatting applied.");
    } else {
        println!("Checking formatting...");
        cmd!(sh, "cargo fmt --all -- --check").run()?;
        println!("✅ Formatting check passed.");
    }
    Ok(())
}

fn clippy(sh: &Shell, fix: bool) -> Result<()> {
    if fix {
        println!("Applying clippy suggestions...");
        cmd!(sh, "cargo clippy --all-targets --fix --allow-dirty").run()?;
        println!("✅ Clippy suggestions applied.");
    } else {
        println!("Running clippy...");
        cmd!(sh, "cargo clippy --all-targets -- -D warnings").run()?;
        println!("✅ Clippy check passed.");
    }
    Ok(())
}

fn test(sh: &Shell, package: Option<&str>) -> Result<()> {
    println!("Running tests...");
    match package {
        Some(pkg) => cmd!(sh, "cargo test -p {pkg}").run()?,
        None => cmd!(sh, "cargo test --workspace").run()?,
    }
    println!("✅ All tests passed.");
    Ok(())
}

fn doc(sh: &Shell, open: bool) -> Result<()> {
    println!("Generating documentation...");
    if open {
        cmd!(sh, "cargo doc --no-deps --open").run()?;
    } else {
        cmd!(sh, "cargo doc --no-deps").run()?;
    }
    println!("✅ Documentation generated.");
    Ok(())
}

fn bench(sh: &Shell, filter: Option<&str>) -> Result<()> {
    println!("Running benchmarks...");
    if let Some(f) = filter {
        cmd!(sh, "cargo bench -- {f}").run()?;
    } else {
        cmd!(sh, "cargo bench").run()?;
    }
    Ok(())
}

fn fuzz(sh: &Shell, target: &str, max_time: u64, list: bool) -> Result<()> {
    let fuzz_dir = sh.current_dir().join("fuzz");
    let targets_dir = fuzz_dir.join("fuzz_targets");

    if list {
        println!("Available fuzz targets:");
        for entry in fs::read_dir(&targets_dir).context("fuzz/fuzz_targets not found")? {
            let entry = entry?;
            if let Some(name) = entry.path().file_stem() {
                println!("  - {}", name.to_string_lossy());
            }
        }
        return Ok(());
    }

    if !targets_dir.join(format!("{target}.rs")).exists() {
        bail!("Unknown fuzz target '{target}'. Use `cargo xtask fuzz --list`.");
    }

    println!("Running fuzz target: {target}");
    println!("Max time: {max_time} seconds");

    // cargo-fuzz requires nightly
    let max_time_str = max_time.to_string();
    cmd!(
        sh,
        "cargo +nightly fuzz run {target} -- -max_total_time={max_time_str}"
    )
    .run()?;

    Ok(())
}

fn bridge(sh: &Shell, backend: &str, listen: &str, polling: bool) -> Result<()> {
    println!("Starting bridge {listen} -> {backend}...");
    let polling = if polling { "true" } else { "false" };
    cmd!(sh, "cargo run -p tds-bridge --example bridge")
        .env("TDS_BRIDGE_BACKEND", backend)
        .env("TDS_BRIDGE_LISTEN", listen)
        .env("TDS_BRIDGE_POLLING", polling)
        .run()?;
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("Cleaning build artifacts...");
    cmd!(sh, "cargo clean").run()?;
    println!("✅ Clean complete.");
    Ok(())
}
