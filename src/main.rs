#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::Client;
use oci_distribution::Reference;
use tracing_subscriber::EnvFilter;

use mink::{
    builds::{BuildContext, Builder},
    bundles::{self, RegistryBundler, SourceBundler},
    docker_config::Keychain,
    resolve::{resolve_references, ResolveOptions},
    runner::{JobExecutor, TektonExecutor},
    scan, Error, Result,
};

#[derive(Parser)]
#[clap(version, about = "Resolve build directives embedded in Kubernetes manifests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Builds every directive in the input and prints the rewritten manifests
    Resolve(ResolveOptions),
    /// Bundles a directory into a self-extracting image and prints its digest
    Bundle(BundleOptions),
}

#[derive(clap::Args)]
struct BundleOptions {
    /// Directory snapshotted into the bundle
    #[clap(long, default_value = ".")]
    directory: PathBuf,

    /// Tag the bundle is pushed to
    #[clap(long)]
    bundle: String,

    /// Base image the bundle layer is appended to
    #[clap(long, default_value = bundles::DEFAULT_BUNDLE_BASE)]
    base: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MINK_LOG").unwrap_or_else(|_| EnvFilter::new("mink=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = tokio::select! {
        outcome = run(cli) => outcome,
        _ = tokio::signal::ctrl_c() => {
            // Dropping `run` cancels in-flight builds; their cleanups respawn
            // as detached tasks that need a moment to reach the API server.
            tokio::time::sleep(Duration::from_secs(2)).await;
            Err(Error::Interrupted)
        }
    };

    if let Err(err) = outcome {
        eprintln!("ERROR: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Resolve(options) => resolve(options).await,
        Commands::Bundle(options) => bundle(options).await,
    }
}

async fn resolve(options: ResolveOptions) -> Result<()> {
    options.validate()?;

    let mut docs = options.load_documents()?;
    let locations = scan::scan(&docs, &Builder::schemes());
    if locations.is_empty() {
        // Nothing to build; the input passes through untouched.
        print!("{}", scan::serialize_documents(&docs)?);
        return Ok(());
    }

    let image = options.image.clone().ok_or(Error::ImageRequired)?;
    let bundle = options.bundle.clone().ok_or(Error::BundleRequired)?;
    let target: Reference = image.parse()?;

    let bundler = RegistryBundler::new(
        bundles::DEFAULT_BUNDLE_BASE.parse()?,
        bundle.parse()?,
        Box::new(Keychain),
    );
    let source_bundle = bundler.bundle(&options.directory).await?;

    let client = Client::try_default().await?;
    let executor: Arc<dyn JobExecutor> = Arc::new(TektonExecutor::new(client));
    let run_options = options.run_options(&executor, target.registry());

    let ctx = BuildContext {
        executor,
        namespace: options.namespace.clone(),
        source_bundle,
        image_target: image,
        dockerfile: options.dockerfile.clone(),
        kaniko_args: options.kaniko_args.clone(),
        builder_image: options.builder.clone(),
        overrides: options.overrides.clone(),
        options: run_options,
    };
    resolve_references(&mut docs, &locations, &ctx, options.parallelism).await?;

    print!("{}", scan::serialize_documents(&docs)?);
    Ok(())
}

async fn bundle(options: BundleOptions) -> Result<()> {
    let bundler = RegistryBundler::new(
        options.base.parse()?,
        options.bundle.parse()?,
        Box::new(Keychain),
    );
    println!("{}", bundler.bundle(&options.directory).await?);
    Ok(())
}
