use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use apkpatch::android::align::{align, verify_alignment};
use apkpatch::android::binary_xml::AndroidManifest;
use apkpatch::android::manifest::{alias_target, launcher_activity, resolve_entry_point};
use apkpatch::android::zip::read_entry;
use apkpatch::workspace::cleanup_stale;
use apkpatch::{InjectionTarget, Patcher, PatcherConfig, Toolchain};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Parent directory for per-run workspaces.
    #[arg(long, global = true)]
    work_root: Option<PathBuf>,

    /// Log debug output (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Patch, rebuild and sign an APK.
    Run {
        apk: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        injection: InjectionArgs,
    },
    /// Patch an APK into a workspace without rebuilding it.
    Patch {
        apk: PathBuf,
        #[command(flatten)]
        injection: InjectionArgs,
    },
    /// Rebuild a workspace left by `patch`.
    Rebuild {
        workspace: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the launcher activity of an APK.
    EntryPoint { apk: PathBuf },
    /// Print the decoded AndroidManifest.xml of an APK.
    Manifest { apk: PathBuf },
    /// zipalign an archive.
    Align { input: PathBuf, output: PathBuf },
    /// List stored entries that are not aligned.
    CheckAlign { apk: PathBuf },
    /// Delete old workspaces.
    Clean {
        #[arg(long, default_value_t = 0)]
        keep: usize,
    },
}

#[derive(Args, Debug)]
struct InjectionArgs {
    /// Where to put the load call.
    #[arg(long, value_enum)]
    target: Option<TargetKind>,

    /// Method selector (name and/or descriptor fragment); implies `--target method`.
    #[arg(long)]
    method: Option<String>,

    /// Library name passed to System.loadLibrary.
    #[arg(long)]
    library: Option<String>,

    /// Directory holding `<abi>/*.so` payloads.
    #[arg(long)]
    assets: Option<PathBuf>,

    /// ABI to copy; repeat for several.
    #[arg(long = "abi")]
    abis: Vec<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TargetKind {
    Constructor,
    EntryMethod,
    Method,
}

fn load_config(cli: &Cli) -> anyhow::Result<PatcherConfig> {
    let mut config = match &cli.config {
        Some(path) => PatcherConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PatcherConfig::default(),
    };
    if let Some(work_root) = &cli.work_root {
        config.work_root = work_root.clone();
    }
    Ok(config)
}

fn apply_injection_args(config: &mut PatcherConfig, args: &InjectionArgs) -> anyhow::Result<()> {
    match (args.target, &args.method) {
        (Some(TargetKind::Constructor), None) => config.target = InjectionTarget::Constructor,
        (Some(TargetKind::EntryMethod), None) => config.target = InjectionTarget::EntryMethod,
        (Some(TargetKind::Method) | None, Some(method)) => {
            config.target = InjectionTarget::Method(method.clone())
        }
        (Some(TargetKind::Method), None) => bail!("--target method needs --method"),
        (Some(_), Some(_)) => bail!("--method only combines with --target method"),
        (None, None) => {}
    }
    if let Some(library) = &args.library {
        config.library_name = library.clone();
    }
    if let Some(assets) = &args.assets {
        config.native_assets = assets.clone();
    }
    if !args.abis.is_empty() {
        config.abis = args.abis.clone();
    }
    config.validate()?;
    Ok(())
}

fn patcher(config: PatcherConfig) -> anyhow::Result<Patcher> {
    let toolchain = Toolchain::from_config(&config.tools, config.api_level);
    Ok(Patcher::new(config, toolchain)?)
}

fn read_manifest(apk: &Path) -> anyhow::Result<AndroidManifest> {
    let bytes = read_entry(apk, "AndroidManifest.xml")
        .with_context(|| format!("reading AndroidManifest.xml from {}", apk.display()))?;
    Ok(AndroidManifest::from_bytes(&bytes)?)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = load_config(&cli)?;
    match &cli.command {
        Command::Run {
            apk,
            output,
            injection,
        } => {
            apply_injection_args(&mut config, injection)?;
            let artifact = patcher(config)?.run(apk, output)?;
            println!("{artifact}");
            if !artifact.is_signed() {
                bail!("{} was written but is not signed", artifact.path().display());
            }
        }
        Command::Patch { apk, injection } => {
            apply_injection_args(&mut config, injection)?;
            let patched = patcher(config)?.patch(apk)?;
            println!("entry point: {}", patched.entry_point);
            println!("edited: {}", patched.instruction_file.display());
            println!("workspace: {}", patched.workspace.root().display());
        }
        Command::Rebuild { workspace, output } => {
            let artifact = patcher(config)?.rebuild(workspace)?;
            match output {
                Some(output) => {
                    std::fs::copy(artifact.path(), output)
                        .with_context(|| format!("writing {}", output.display()))?;
                    println!("{}", artifact.with_path(output.clone()));
                }
                None => println!("{artifact}"),
            }
        }
        Command::EntryPoint { apk } => {
            let manifest = read_manifest(apk)?;
            let entry = resolve_entry_point(&manifest)?;
            println!("package: {}", manifest.package_name().unwrap_or("?"));
            if let Some(code) = manifest.version_code() {
                println!("version code: {code}");
            }
            if let Some(name) = manifest.version_name() {
                println!("version name: {name}");
            }
            println!("debuggable: {}", manifest.is_debuggable().unwrap_or(false));
            if let Some(raw) = launcher_activity(&manifest) {
                println!("declared as: {raw}");
            }
            println!("entry point: {entry}");
            if let Some(target) = alias_target(&manifest, &entry) {
                println!("alias of: {target}");
            }
        }
        Command::Manifest { apk } => {
            print!("{}", read_manifest(apk)?.to_xml_string()?);
            println!();
        }
        Command::Align { input, output } => {
            let report = align(input, output, config.word_alignment, config.page_alignment)?;
            println!(
                "{} entries, {} padded with {} bytes",
                report.entries, report.padded, report.padding_bytes
            );
        }
        Command::CheckAlign { apk } => {
            let misaligned = verify_alignment(apk, config.word_alignment, config.page_alignment)?;
            for entry in &misaligned {
                println!(
                    "{} at {} (needs {})",
                    entry.name, entry.data_offset, entry.required
                );
            }
            if !misaligned.is_empty() {
                bail!("{} entries are misaligned", misaligned.len());
            }
            println!("all stored entries aligned");
        }
        Command::Clean { keep } => {
            let removed = cleanup_stale(&config.work_root, *keep)?;
            println!("removed {removed} workspaces from {}", config.work_root.display());
        }
    }
    Ok(())
}
