//! Build automation tasks for the mssql-driver-pool workspace.
//!
//! Run with `cargo xtask <command>`.
//!
//! ## Available Commands
//!
//! - `ci`: Run all CI checks (format, lint, test, doc)
//! - `fmt`: Check/apply code formatting
//! - `clippy`: Run clippy lints
//! - `test`: Run all tests
//! - `scenarios`: Run the connection lifecycle scenarios with logging
//! - `doc`: Generate documentation
//! - `clean`: Clean build artifacts
//! - `coverage`: Run code coverage
//! - `semver`: Check published crates for semver violations
//! - `dist`: Package the publishable crates

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

/// Crates published to crates.io, in dependency order.
const PUBLISHED: [&str; 2] = ["mssql-retry", "mssql-driver-pool"];

#[derive(Parser)]
#[command(name = "xtask", about = "Build automation for mssql-driver-pool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all checks (format, lint, test, doc)
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
    /// Run the lifecycle scenarios with tracing output
    Scenarios {
        /// `RUST_LOG` filter for the run
        #[arg(long, default_value = "mssql_driver_pool=debug,mssql_retry=debug")]
        log: String,
    },
    /// Generate documentation
    Doc {
        /// Open documentation in browser
        #[arg(long)]
        open: bool,
    },
    /// Clean build artifacts
    Clean,
    /// Run code coverage
    Coverage {
        /// Output format (html, lcov, json)
        #[arg(long, default_value = "html")]
        format: String,
    },
    /// Check for semver violations (requires cargo-semver-checks)
    Semver,
    /// Package the publishable crates
    Dist {
        /// Skip running tests before packaging
        #[arg(long)]
        no_test: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    let workspace_root = workspace_root()?;
    sh.change_dir(&workspace_root);

    match cli.command {
        Command::Ci => {
            println!("Running CI checks...");
            fmt(&sh, false)?;
            clippy(&sh, false)?;
            test(&sh, None)?;
            doc(&sh, false)?;
            println!("\n✅ All CI checks passed!");
        }
        Command::Fmt { fix } => fmt(&sh, fix)?,
        Command::Clippy { fix } => clippy(&sh, fix)?,
        Command::Test { package } => test(&sh, package.as_deref())?,
        Command::Scenarios { log } => scenarios(&sh, &log)?,
        Command::Doc { open } => doc(&sh, open)?,
        Command::Clean => clean(&sh)?,
        Command::Coverage { format } => coverage(&sh, &format)?,
        Command::Semver => semver(&sh)?,
        Command::Dist { no_test } => dist(&sh, no_test)?,
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

fn scenarios(sh: &Shell, log: &str) -> Result<()> {
    println!("Running lifecycle scenarios...");
    let _env = sh.push_env("RUST_LOG", log);
    cmd!(
        sh,
        "cargo test -p mssql-testing --test scenarios -- --nocapture --test-threads=1"
    )
    .run()?;
    println!("✅ Scenarios passed.");
    Ok(())
}

fn doc(sh: &Shell, open: bool) -> Result<()> {
    println!("Generating documentation...");
    if open {
        cmd!(sh, "cargo doc --workspace --no-deps --open").run()?;
    } else {
        cmd!(sh, "cargo doc --workspace --no-deps").run()?;
    }
    println!("✅ Documentation generated.");
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("Cleaning build artifacts...");
    cmd!(sh, "cargo clean").run()?;
    println!("✅ Clean complete.");
    Ok(())
}

fn coverage(sh: &Shell, format: &str) -> Result<()> {
    println!("Running code coverage...");

    // Requires cargo-llvm-cov
    match format {
        "html" => {
            cmd!(sh, "cargo llvm-cov --workspace --html").run()?;
            println!("✅ Coverage report: target/llvm-cov/html/index.html");
        }
        "lcov" => {
            cmd!(
                sh,
                "cargo llvm-cov --workspace --lcov --output-path target/lcov.info"
            )
            .run()?;
            println!("✅ Coverage report: target/lcov.info");
        }
        "json" => {
            cmd!(
                sh,
                "cargo llvm-cov --workspace --json --output-path target/coverage.json"
            )
            .run()?;
            println!("✅ Coverage report: target/coverage.json");
        }
        _ => {
            bail!("Unknown coverage format: {format}. Use html, lcov, or json.");
        }
    }

    Ok(())
}

fn semver(sh: &Shell) -> Result<()> {
    println!("Checking for semver violations...");
    for crate_name in PUBLISHED {
        println!("  Checking {crate_name}...");
        cmd!(sh, "cargo semver-checks check-release -p {crate_name}").run()?;
    }
    println!("✅ No semver violations detected.");
    Ok(())
}

fn dist(sh: &Shell, no_test: bool) -> Result<()> {
    println!("Packaging crates...");

    if !no_test {
        println!("Running tests before packaging...");
        test(sh, None)?;
    }

    for crate_name in PUBLISHED {
        cmd!(sh, "cargo package -p {crate_name} --allow-dirty").run()?;
    }

    println!("✅ Packages: target/package/");
    Ok(())
}
