//! Command-line extractor for boot-image artifacts published via a release
//! image.
//!
//! `pluckctl` resolves a named component of a release image to its concrete
//! pullspec, then pulls just the boot-image checksum file out of that
//! image's layers, writing it into the destination directory. The two
//! phases fail with distinct exit codes so callers can tell "the release
//! has no such component" apart from "the extraction itself failed".

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use pluck::auth::CredentialStore;
use pluck::mirror::MirrorPolicy;
use pluck::platform::Arch;
use pluck::{
    extract, resolve_component, ImageReference, MatchRule, RegistryBlobSource, TraversalPolicy,
};

/// Component resolution failed: bad release reference, unreadable release
/// image, or no such component.
const EXIT_RESOLUTION: u8 = 2;
/// Extraction failed, or the component image does not carry the artifact.
const EXIT_EXTRACTION: u8 = 3;

/// pluckctl
#[derive(Debug, Parser)]
#[clap(name = "pluckctl", version)]
struct App {
    /// Release image pullspec to resolve the component from
    release: String,

    /// Directory to write the extracted artifact into
    #[clap(long, default_value = ".")]
    dest_dir: PathBuf,

    /// Registry credentials file (dockerconfig JSON); anonymous if omitted
    #[clap(long)]
    registry_config: Option<PathBuf>,

    /// Target CPU architecture of the boot image
    #[clap(long, default_value = "x86_64")]
    arch: String,

    /// Release component that carries the boot images
    #[clap(long, default_value = "machine-os-images")]
    component: String,

    /// Image content source policy file naming registry mirrors to try on
    /// error
    #[clap(long)]
    icsp_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = App::parse();

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: App) -> anyhow::Result<ExitCode> {
    let arch = Arch::new(&args.arch);

    let mut source = RegistryBlobSource::new(&arch);
    if let Some(path) = &args.registry_config {
        let store = CredentialStore::load(path).context("loading registry credentials")?;
        source = source.with_credentials(store);
    }
    if let Some(path) = &args.icsp_file {
        let policy = MirrorPolicy::load(path).context("loading mirror policy")?;
        source = source.with_mirror_policy(policy);
    }

    let release = match ImageReference::parse(&args.release) {
        Ok(release) => release,
        Err(err) => {
            error!("{err}");
            return Ok(ExitCode::from(EXIT_RESOLUTION));
        }
    };

    let pullspec = match resolve_component(&source, &release, &args.component).await {
        Ok(pullspec) => pullspec,
        Err(err) => {
            error!("cannot resolve component {:?}: {err}", args.component);
            return Ok(ExitCode::from(EXIT_RESOLUTION));
        }
    };
    info!("component {} is {pullspec}", args.component);

    let target = format!("/coreos/coreos-{}.iso.sha256", arch.name());
    let extracted = async {
        let image = ImageReference::parse(&pullspec)?;
        let rule = MatchRule::for_path(&target)?;
        extract(
            &args.dest_dir,
            &image,
            &[rule],
            &source,
            TraversalPolicy::VisitAll,
        )
        .await
    }
    .await;

    match extracted {
        Ok(result) => match result.written(0).first() {
            Some(path) => {
                info!("wrote {}", path.display());
                println!("{}", path.display());
                Ok(ExitCode::SUCCESS)
            }
            None => {
                error!("{pullspec} does not carry {target}");
                Ok(ExitCode::from(EXIT_EXTRACTION))
            }
        },
        Err(err) => {
            error!("cannot extract {target} from {pullspec}: {err}");
            if err.is_retryable() {
                info!("transport failure: re-running the extraction is safe");
            }
            Ok(ExitCode::from(EXIT_EXTRACTION))
        }
    }
}
