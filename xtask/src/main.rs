//! xtask: development tasks for rskt
//!
//! Run with: `cargo xtask <command>`

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use xshell::{cmd, Shell};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Development tasks for rskt")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests (workspace + fuzz harnesses in smoke mode)
    Test,
    /// Run the conformance scenarios against one or both transfer modes
    Conformance {
        #[arg(value_enum)]
        transfer: Option<Transfer>,
    },
    /// Run fuzz tests with bolero
    Fuzz {
        /// Target to fuzz. Without one, every harness runs once as a smoke test.
        #[arg(value_enum)]
        target: Option<FuzzTarget>,
    },
    /// Run clippy on all code
    Clippy,
    /// Check formatting
    Fmt {
        /// Fix formatting issues instead of just checking
        #[arg(long)]
        fix: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Transfer {
    Push,
    Dma,
}

#[derive(Clone, Copy, ValueEnum)]
enum FuzzTarget {
    /// Handle table acquire/release/transition
    HandleTable,
    /// Byte-ring pointer arithmetic and wrap-around
    ByteRing,
    /// Handshake phase interleavings
    Handshake,
}

impl FuzzTarget {
    fn test_name(self) -> &'static str {
        match self {
            FuzzTarget::HandleTable => "handle_table",
            FuzzTarget::ByteRing => "byte_ring",
            FuzzTarget::Handshake => "handshake",
        }
    }
}

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn workspace_root() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let manifest_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => std::env::current_dir()?.join("xtask"),
    };
    Ok(manifest_dir
        .parent()
        .ok_or("xtask has no parent directory")?
        .to_path_buf())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let sh = Shell::new()?;
    let root = workspace_root()?;
    sh.change_dir(&root);

    match cli.command {
        Commands::Test => {
            println!("=== Running workspace tests ===");

            // Try nextest first, fall back to cargo test
            if cmd!(sh, "cargo nextest --version").quiet().run().is_ok() {
                println!("Using cargo-nextest");
                cmd!(sh, "cargo nextest run --workspace").run()?;
            } else {
                println!("cargo-nextest not found, using cargo test");
                cmd!(sh, "cargo test --workspace").run()?;
            }

            println!("\n=== Running fuzz harnesses (test mode) ===");
            sh.change_dir(root.join("fuzz"));
            cmd!(sh, "cargo test").run()?;

            println!("\n=== All tests passed ===");
        }
        Commands::Conformance { transfer } => {
            let filter = match transfer {
                Some(Transfer::Push) => "push::",
                Some(Transfer::Dma) => "dma::",
                None => "",
            };
            println!("=== Conformance scenarios {filter} ===");
            cmd!(sh, "cargo test -p rskt-testkit --test conformance -- {filter}").run()?;
        }
        Commands::Fuzz { target } => {
            sh.change_dir(root.join("fuzz"));

            if let Some(target) = target {
                let t = target.test_name();
                println!("=== Fuzzing target: {t} ===");
                println!("Press Ctrl+C to stop.\n");

                if cmd!(sh, "cargo bolero --version").quiet().run().is_err() {
                    eprintln!("cargo-bolero not found. Install with:");
                    eprintln!("  cargo install cargo-bolero");
                    return Err("cargo-bolero not installed".into());
                }

                cmd!(sh, "cargo bolero test {t}").run()?;
            } else {
                println!("=== Running all fuzz harnesses in test mode ===");
                println!("(For real fuzzing, name a target: cargo xtask fuzz byte-ring)\n");
                cmd!(sh, "cargo test").run()?;
            }
        }
        Commands::Clippy => {
            println!("=== Running clippy ===");
            cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;

            println!("\n=== Clippy on fuzz crate ===");
            sh.change_dir(root.join("fuzz"));
            cmd!(sh, "cargo clippy --all-targets -- -D warnings").run()?;
        }
        Commands::Fmt { fix } => {
            if fix {
                println!("=== Fixing formatting ===");
                cmd!(sh, "cargo fmt --all").run()?;
                sh.change_dir(root.join("fuzz"));
                cmd!(sh, "cargo fmt").run()?;
            } else {
                println!("=== Checking formatting ===");
                cmd!(sh, "cargo fmt --all -- --check").run()?;
                sh.change_dir(root.join("fuzz"));
                cmd!(sh, "cargo fmt -- --check").run()?;
            }
        }
    }

    Ok(())
}
