use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{exit, Command};

use clap::{Parser, Subcommand, ValueEnum};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const LAMBDA_PACKAGE: &str = "device_relay_lambda";
const LAMBDA_BINARY: &str = "relay_lambda";
const WORKSPACE_PACKAGES: [&str; 2] = ["device_relay_core", LAMBDA_PACKAGE];

#[derive(Parser)]
#[command(
    name = "xtask",
    about = "Task runner for the device relay workspace",
    long_about = "CI checks and Lambda packaging for the device session relay."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run CI checks
    Ci {
        #[arg(value_enum, default_value_t = CiJob::All)]
        job: CiJob,
    },
    /// Build the relay Lambda and zip it as `bootstrap`
    Package {
        /// Compilation target triple for the Lambda binary
        #[arg(long, default_value = "x86_64-unknown-linux-gnu")]
        target: String,
        #[arg(value_enum, long, default_value_t = BuildProfile::Release)]
        profile: BuildProfile,
        /// Directory receiving `relay.zip`
        #[arg(long, env = "RELAY_DIST_DIR", default_value = "dist")]
        out_dir: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CiJob {
    /// Formatting and clippy
    Lint,
    /// Tests of every workspace crate
    Test,
    All,
}

#[derive(Clone, Copy, ValueEnum)]
enum BuildProfile {
    Debug,
    Release,
}

impl BuildProfile {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }

    fn as_cargo_flag(self) -> Option<&'static str> {
        match self {
            Self::Debug => None,
            Self::Release => Some("--release"),
        }
    }
}

type TaskResult = Result<(), String>;

fn step(label: &str) {
    eprintln!("\n=== {label} ===");
}

fn run_cargo(args: &[&str]) -> TaskResult {
    eprintln!("+ cargo {}", args.join(" "));
    let status = Command::new("cargo")
        .args(args)
        .status()
        .map_err(|error| format!("failed to execute cargo: {error}"))?;

    if status.success() {
        Ok(())
    } else {
        Err(format!(
            "`cargo {}` exited with {}",
            args.join(" "),
            status.code().map_or("a signal".to_string(), |code| code.to_string())
        ))
    }
}

fn ci_lint() -> TaskResult {
    step("Check formatting");
    run_cargo(&["fmt", "--all", "--", "--check"])?;

    step("Clippy");
    run_cargo(&[
        "clippy",
        "--workspace",
        "--all-targets",
        "--all-features",
        "--",
        "-D",
        "warnings",
    ])
}

fn ci_test() -> TaskResult {
    for package in WORKSPACE_PACKAGES {
        step(&format!("Test {package}"));
        run_cargo(&["test", "-p", package])?;
    }
    Ok(())
}

fn package_lambda(target: &str, profile: BuildProfile, out_dir: &Path) -> TaskResult {
    ensure_rust_target_installed(target)?;
    ensure_c_linker_available(target)?;

    step("Build relay lambda");
    let mut cargo_args = vec![
        "build",
        "-p",
        LAMBDA_PACKAGE,
        "--target",
        target,
        "--bin",
        LAMBDA_BINARY,
    ];
    if let Some(flag) = profile.as_cargo_flag() {
        cargo_args.push(flag);
    }
    run_cargo(&cargo_args)?;

    step("Package lambda zip");
    let binary = Path::new("target")
        .join(target)
        .join(profile.dir_name())
        .join(binary_name(LAMBDA_BINARY, target));
    fs::create_dir_all(out_dir)
        .map_err(|error| format!("failed to create '{}': {error}", out_dir.display()))?;

    let zip_path = out_dir.join("relay.zip");
    write_bootstrap_zip(&binary, &zip_path)?;
    eprintln!("\nPackaged artifact:\n- {}", zip_path.display());
    Ok(())
}

fn ensure_rust_target_installed(target: &str) -> TaskResult {
    let output = match Command::new("rustup")
        .args(["target", "list", "--installed"])
        .output()
    {
        Ok(value) => value,
        Err(error) => {
            eprintln!(
                "warning: failed to run `rustup target list --installed` ({error}); continuing without target preflight"
            );
            return Ok(());
        }
    };

    if !output.status.success() {
        return Err(format!(
            "failed to list installed rust targets: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    let installed = String::from_utf8_lossy(&output.stdout);
    if installed.lines().any(|line| line.trim() == target) {
        Ok(())
    } else {
        Err(format!(
            "rust target `{target}` is not installed; run `rustup target add {target}` and retry"
        ))
    }
}

/// Cross builds to Linux from Windows need a Linux C toolchain for `ring`.
fn ensure_c_linker_available(target: &str) -> TaskResult {
    if !cfg!(windows) || !target.ends_with("unknown-linux-gnu") {
        return Ok(());
    }

    let overrides = [
        format!("CC_{}", target.replace('-', "_")),
        format!("CC_{target}"),
        "TARGET_CC".to_string(),
        "CC".to_string(),
    ];
    let configured = overrides
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .any(|value| !value.trim().is_empty() && tool_works(value.trim()));

    let canonical = "x86_64-linux-gnu-gcc";
    if configured || tool_works(canonical) {
        return Ok(());
    }

    Err(format!(
        "missing C cross-linker for target `{target}`; install `{canonical}` or set CC_{}",
        target.replace('-', "_")
    ))
}

fn tool_works(program: &str) -> bool {
    let mut parts = program.split_whitespace();
    let Some(bin) = parts.next() else {
        return false;
    };

    Command::new(bin)
        .args(parts)
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn binary_name(bin_name: &str, target: &str) -> String {
    if target.contains("windows") {
        format!("{bin_name}.exe")
    } else {
        bin_name.to_string()
    }
}

fn write_bootstrap_zip(binary_path: &Path, zip_path: &Path) -> TaskResult {
    let binary = fs::read(binary_path).map_err(|error| {
        format!(
            "failed to read lambda binary '{}': {error}",
            binary_path.display()
        )
    })?;
    let file = fs::File::create(zip_path)
        .map_err(|error| format!("failed to create '{}': {error}", zip_path.display()))?;

    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o755);
    zip.start_file("bootstrap", options)
        .map_err(|error| format!("failed to start bootstrap entry: {error}"))?;
    zip.write_all(&binary)
        .map_err(|error| format!("failed to write bootstrap entry: {error}"))?;
    zip.finish()
        .map_err(|error| format!("failed to finish lambda zip: {error}"))?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Ci { job } => match job {
            CiJob::Lint => ci_lint(),
            CiJob::Test => ci_test(),
            CiJob::All => ci_lint().and_then(|()| ci_test()),
        },
        Commands::Package {
            target,
            profile,
            out_dir,
        } => package_lambda(&target, profile, &out_dir),
    };

    match result {
        Ok(()) => eprintln!("\nDone."),
        Err(message) => {
            eprintln!("\nerror: {message}");
            exit(1);
        }
    }
}
