use std::collections::HashMap;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use futures::{stream, StreamExt, TryStreamExt};
use serde_yaml::Value;
use tracing::{debug, info};
use url::Url;

use crate::{
    builds::{BuildContext, Builder, DEFAULT_BUILDER_IMAGE},
    runner::{JobExecutor, RunAs, RunOption, TemporaryIdentity},
    scan, Error, Result,
};

/// Flags for `mink resolve`.
#[derive(Clone, Debug, Args)]
pub struct ResolveOptions {
    /// Input manifests; "-" reads stdin, directories are expanded to their
    /// .yaml/.yml files
    #[clap(short = 'f', long = "filename", required = true)]
    pub filenames: Vec<PathBuf>,

    /// Descend into directories named by --filename
    #[clap(short = 'R', long)]
    pub recursive: bool,

    /// Maximum number of builds in flight at once
    #[clap(short = 'P', long, default_value_t = 20)]
    pub parallelism: usize,

    /// Tag every build pushes to; directives are rewritten to <image>@<digest>
    #[clap(long)]
    pub image: Option<String>,

    /// Tag the source bundle is pushed to
    #[clap(long)]
    pub bundle: Option<String>,

    /// Directory snapshotted as the build source
    #[clap(long, default_value = ".")]
    pub directory: PathBuf,

    /// Service account builds run as; "me" provisions a temporary identity
    /// carrying your local registry credentials
    #[clap(long = "as", value_name = "SERVICE_ACCOUNT")]
    pub identity: Option<String>,

    /// Dockerfile used when a dockerfile:/// directive names no path
    #[clap(long, default_value = "Dockerfile")]
    pub dockerfile: String,

    /// Extra arguments appended to the kaniko invocation
    #[clap(long, value_name = "ARG")]
    pub kaniko_args: Vec<String>,

    /// Buildpack builder image
    #[clap(long, default_value = DEFAULT_BUILDER_IMAGE)]
    pub builder: String,

    /// KEY=VALUE pairs surfaced to the buildpack build phase
    #[clap(long, value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Namespace builds run in
    #[clap(short = 'n', long, default_value = "default")]
    pub namespace: String,
}

impl ResolveOptions {
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::NonPositiveParallelism(self.parallelism));
        }
        Ok(())
    }

    /// Reads every named input into a flat, order-preserving document list.
    pub fn load_documents(&self) -> Result<Vec<Value>> {
        let mut docs = Vec::new();
        for filename in &self.filenames {
            if filename == Path::new("-") {
                let mut input = String::new();
                std::io::stdin().read_to_string(&mut input)?;
                docs.extend(scan::parse_documents(&input)?);
            } else if filename.is_dir() {
                let mut files = Vec::new();
                yaml_files(filename, self.recursive, &mut files)?;
                for file in files {
                    debug!(file = %file.display(), "reading");
                    docs.extend(scan::parse_documents(&std::fs::read_to_string(file)?)?);
                }
            } else {
                docs.extend(scan::parse_documents(&std::fs::read_to_string(filename)?)?);
            }
        }
        Ok(docs)
    }

    /// The run options implied by `--as`.
    pub fn run_options(
        &self,
        executor: &Arc<dyn JobExecutor>,
        registry: &str,
    ) -> Vec<Arc<dyn RunOption>> {
        match self.identity.as_deref() {
            None => vec![],
            Some("me") => vec![Arc::new(TemporaryIdentity {
                executor: executor.clone(),
                registry: registry.to_string(),
            })],
            Some(name) => vec![Arc::new(RunAs(name.to_string()))],
        }
    }
}

fn yaml_files(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                yaml_files(&path, recursive, out)?;
            }
        } else if matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml" | "yml")
        ) {
            out.push(path);
        }
    }
    Ok(())
}

/// Builds every distinct directive in `locations` (each exactly once, at
/// most `parallelism` in flight) and rewrites the documents in place.
///
/// The first failed build fails the whole pass: sibling builds still in
/// flight are dropped, and their cluster runs are deleted in the background.
pub async fn resolve_references(
    docs: &mut [Value],
    locations: &scan::Locations,
    ctx: &BuildContext,
    parallelism: usize,
) -> Result<()> {
    let builders = Builder::table();
    let mut jobs = Vec::with_capacity(locations.len());
    for directive in locations.keys() {
        let url = Url::parse(directive).map_err(|source| Error::BadReference {
            reference: directive.clone(),
            source,
        })?;
        if let Some(builder) = builders.get(url.scheme()) {
            jobs.push((directive.clone(), url, *builder));
        }
    }

    let resolved: HashMap<String, String> = stream::iter(jobs)
        .map(|(directive, url, builder)| async move {
            info!(%directive, "building");
            let resolved = builder.build(ctx, &url).await?;
            info!(%directive, %resolved, "resolved");
            Ok::<_, Error>((directive, resolved))
        })
        .buffer_unordered(parallelism)
        .try_collect()
        .await?;

    scan::rewrite(docs, locations, &resolved)
}
