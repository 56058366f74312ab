use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{EnvVar, Volume, VolumeMount};
use kube::ResourceExt;
use oci_distribution::Reference;
use url::Url;

use crate::{
    resources::{
        JobRef, Param, ParamSpec, PipelineRun, PipelineRunSpec, ResultSpec, Step, TaskRun,
        TaskRunSpec, TaskSpec,
    },
    runner::{self, JobExecutor, RunOption},
    Error, Result, IMAGE_DIGEST_RESULT, IMAGE_TARGET_PARAM, SOURCE_BUNDLE_PARAM,
};

/// Where Tekton surfaces a step-written result file.
const RESULTS_PATH: &str = "/tekton/results";

const KANIKO_IMAGE: &str = "gcr.io/kaniko-project/executor:v1.9.1";

const KO_IMAGE: &str = "ghcr.io/ko-build/ko:latest";

/// Default CNB builder, overridable with `--builder`.
pub const DEFAULT_BUILDER_IMAGE: &str = "paketobuildpacks/builder-jammy-base:latest";

/// Everything a builder needs beyond its parsed directive. One context is
/// shared by every build of a resolution pass, so all builds observe the
/// same source bundle digest.
pub struct BuildContext {
    pub executor: Arc<dyn JobExecutor>,
    pub namespace: String,
    pub source_bundle: String,
    pub image_target: String,
    pub dockerfile: String,
    pub kaniko_args: Vec<String>,
    pub builder_image: String,
    pub overrides: Vec<String>,
    pub options: Vec<Arc<dyn RunOption>>,
}

/// The builder selected by a directive's scheme.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Builder {
    Dockerfile,
    Buildpack,
    Ko,
    Task,
    Pipeline,
}

impl Builder {
    /// The scheme dispatch table. Adding a scheme is one line here.
    pub fn table() -> HashMap<&'static str, Builder> {
        HashMap::from([
            ("dockerfile", Builder::Dockerfile),
            ("buildpack", Builder::Buildpack),
            ("ko", Builder::Ko),
            ("task", Builder::Task),
            ("pipeline", Builder::Pipeline),
        ])
    }

    pub fn schemes() -> Vec<&'static str> {
        Self::table().keys().copied().collect()
    }

    /// Turns one parsed directive into a submitted run and returns
    /// `<image target>@<digest>` from its declared result.
    pub async fn build(&self, ctx: &BuildContext, url: &Url) -> Result<String> {
        match self {
            Builder::Dockerfile => dockerfile(ctx, url).await,
            Builder::Buildpack => buildpack(ctx, url).await,
            Builder::Ko => ko(ctx, url).await,
            Builder::Task => task(ctx, url).await,
            Builder::Pipeline => pipeline(ctx, url).await,
        }
    }
}

/// The dockerfile and buildpack schemes select a sub-path only; a host
/// segment is almost always a missing third slash.
fn reject_host(url: &Url, scheme: &'static str) -> Result<()> {
    let host = url.host_str().unwrap_or_default();
    if host.is_empty() {
        return Ok(());
    }
    Err(Error::UnexpectedHost {
        host: host.to_string(),
        reference: url.to_string(),
        suggestion: format!("{scheme}:///{host}{}", url.path()),
    })
}

/// Bundle images self-extract into the directory given as their argument.
fn extract_step(source_bundle: &str) -> Step {
    Step {
        name: "extract-bundle".to_string(),
        image: source_bundle.to_string(),
        args: vec!["/workspace".to_string()],
        ..Default::default()
    }
}

fn digest_result() -> Vec<ResultSpec> {
    vec![ResultSpec {
        name: IMAGE_DIGEST_RESULT.to_string(),
        description: None,
    }]
}

fn new_task_run(ctx: &BuildContext, prefix: &str, spec: TaskRunSpec) -> TaskRun {
    let mut run = TaskRun::new("", spec);
    run.metadata.name = None;
    run.metadata.generate_name = Some(prefix.to_string());
    run.metadata.namespace = Some(ctx.namespace.clone());
    run
}

fn resolved(ctx: &BuildContext, name: &str, digest: Option<&str>) -> Result<String> {
    let digest = digest.ok_or_else(|| Error::MissingResult {
        name: name.to_string(),
        result: IMAGE_DIGEST_RESULT.to_string(),
    })?;
    Ok(format!("{}@{digest}", ctx.image_target))
}

async fn dockerfile(ctx: &BuildContext, url: &Url) -> Result<String> {
    reject_host(url, "dockerfile")?;

    let dockerfile = match url.path().trim_start_matches('/') {
        "" => ctx.dockerfile.clone(),
        path => path.to_string(),
    };
    let mut args = vec![
        format!("--dockerfile=/workspace/{dockerfile}"),
        "--context=/workspace".to_string(),
        format!("--destination={}", ctx.image_target),
        format!("--digest-file={RESULTS_PATH}/{IMAGE_DIGEST_RESULT}"),
    ];
    args.extend(ctx.kaniko_args.iter().cloned());

    let spec = TaskRunSpec {
        task_spec: Some(TaskSpec {
            results: digest_result(),
            steps: vec![
                extract_step(&ctx.source_bundle),
                Step {
                    name: "build-and-push".to_string(),
                    image: KANIKO_IMAGE.to_string(),
                    args,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }),
        ..Default::default()
    };

    let run = runner::run_task(
        &ctx.executor,
        new_task_run(ctx, "mink-dockerfile-", spec),
        &ctx.options,
    )
    .await?;
    resolved(ctx, &run.name_any(), run.result(IMAGE_DIGEST_RESULT))
}

async fn buildpack(ctx: &BuildContext, url: &Url) -> Result<String> {
    reject_host(url, "buildpack")?;

    let layers_mounts = vec![
        VolumeMount {
            name: "layers".to_string(),
            mount_path: "/layers".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "cache".to_string(),
            mount_path: "/cache".to_string(),
            ..Default::default()
        },
    ];
    let phase = |name: &str, command: &str, args: &[String]| Step {
        name: name.to_string(),
        image: ctx.builder_image.clone(),
        command: vec![command.to_string()],
        args: args.to_vec(),
        volume_mounts: layers_mounts.clone(),
        ..Default::default()
    };

    // `--overrides` entries are KEY=VALUE pairs surfaced to the build phase.
    let env = ctx
        .overrides
        .iter()
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair.as_str(), ""));
            EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                ..Default::default()
            }
        })
        .collect::<Vec<_>>();

    let app = match url.path().trim_start_matches('/') {
        "" => "/workspace".to_string(),
        path => format!("/workspace/{path}"),
    };

    let mut build_phase = phase(
        "build",
        "/cnb/lifecycle/builder",
        &[
            format!("-app={app}"),
            "-layers=/layers".to_string(),
            "-group=/layers/group.toml".to_string(),
            "-plan=/layers/plan.toml".to_string(),
        ],
    );
    build_phase.env = env;

    let spec = TaskRunSpec {
        task_spec: Some(TaskSpec {
            results: digest_result(),
            steps: vec![
                extract_step(&ctx.source_bundle),
                phase(
                    "detect",
                    "/cnb/lifecycle/detector",
                    &[
                        format!("-app={app}"),
                        "-group=/layers/group.toml".to_string(),
                        "-plan=/layers/plan.toml".to_string(),
                    ],
                ),
                phase(
                    "analyze",
                    "/cnb/lifecycle/analyzer",
                    &["-layers=/layers".to_string(), ctx.image_target.clone()],
                ),
                phase(
                    "restore",
                    "/cnb/lifecycle/restorer",
                    &[
                        "-cache-dir=/cache".to_string(),
                        "-layers=/layers".to_string(),
                    ],
                ),
                build_phase,
                phase(
                    "export",
                    "/cnb/lifecycle/exporter",
                    &[
                        format!("-app={app}"),
                        "-layers=/layers".to_string(),
                        "-group=/layers/group.toml".to_string(),
                        "-report=/layers/report.toml".to_string(),
                        ctx.image_target.clone(),
                    ],
                ),
                Step {
                    name: "report".to_string(),
                    image: ctx.builder_image.clone(),
                    command: vec!["/bin/sh".to_string(), "-c".to_string()],
                    args: vec![format!(
                        "sed -n 's/^digest = \"\\(.*\\)\"$/\\1/p' /layers/report.toml > {RESULTS_PATH}/{IMAGE_DIGEST_RESULT}"
                    )],
                    volume_mounts: layers_mounts.clone(),
                    ..Default::default()
                },
            ],
            volumes: vec![
                Volume {
                    name: "layers".to_string(),
                    empty_dir: Some(Default::default()),
                    ..Default::default()
                },
                Volume {
                    name: "cache".to_string(),
                    empty_dir: Some(Default::default()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }),
        ..Default::default()
    };

    let run = runner::run_task(
        &ctx.executor,
        new_task_run(ctx, "mink-buildpack-", spec),
        &ctx.options,
    )
    .await?;
    resolved(ctx, &run.name_any(), run.result(IMAGE_DIGEST_RESULT))
}

async fn ko(ctx: &BuildContext, url: &Url) -> Result<String> {
    let import_path = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
    let target: Reference = ctx.image_target.parse()?;
    let repository = format!("{}/{}", target.registry(), target.repository());

    let spec = TaskRunSpec {
        task_spec: Some(TaskSpec {
            results: digest_result(),
            steps: vec![
                extract_step(&ctx.source_bundle),
                Step {
                    name: "ko-publish".to_string(),
                    image: KO_IMAGE.to_string(),
                    command: vec!["/bin/sh".to_string(), "-c".to_string()],
                    args: vec![format!(
                        "ko build --bare {import_path} | cut -d@ -f2 > {RESULTS_PATH}/{IMAGE_DIGEST_RESULT}"
                    )],
                    working_dir: Some("/workspace".to_string()),
                    env: vec![EnvVar {
                        name: "KO_DOCKER_REPO".to_string(),
                        value: Some(repository),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            ],
            ..Default::default()
        }),
        ..Default::default()
    };

    let run = runner::run_task(
        &ctx.executor,
        new_task_run(ctx, "mink-ko-", spec),
        &ctx.options,
    )
    .await?;
    resolved(ctx, &run.name_any(), run.result(IMAGE_DIGEST_RESULT))
}

/// The mink parameter/result contract a referenced Task or Pipeline must
/// declare before we will run it.
fn validate_contract(
    kind: &'static str,
    name: &str,
    params: &[ParamSpec],
    results: &[ResultSpec],
) -> Result<()> {
    let mut missing = Vec::new();
    for required in [SOURCE_BUNDLE_PARAM, IMAGE_TARGET_PARAM] {
        if !params.iter().any(|p| p.name == required) {
            missing.push(format!("parameter {required:?}"));
        }
    }
    if !results.iter().any(|r| r.name == IMAGE_DIGEST_RESULT) {
        missing.push(format!("result {IMAGE_DIGEST_RESULT:?}"));
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::IncompleteContract {
            kind,
            name: name.to_string(),
            missing: missing.join(", "),
        })
    }
}

fn contract_params(ctx: &BuildContext, url: &Url) -> Vec<Param> {
    let mut params = vec![
        Param::string(SOURCE_BUNDLE_PARAM, &ctx.source_bundle),
        Param::string(IMAGE_TARGET_PARAM, &ctx.image_target),
    ];
    // Query pairs map 1:1 onto the job's other declared parameters.
    for (key, value) in url.query_pairs() {
        params.push(Param::string(key, value));
    }
    params
}

async fn task(ctx: &BuildContext, url: &Url) -> Result<String> {
    let name = url.host_str().unwrap_or_default();
    if name.is_empty() {
        return Err(Error::MissingJobName {
            reference: url.to_string(),
            kind: "Task",
            scheme: "task",
        });
    }

    let definition = ctx.executor.get_task(&ctx.namespace, name).await?;
    validate_contract("Task", name, &definition.spec.params, &definition.spec.results)?;

    let spec = TaskRunSpec {
        task_ref: Some(JobRef {
            name: name.to_string(),
        }),
        params: contract_params(ctx, url),
        ..Default::default()
    };

    let run = runner::run_task(
        &ctx.executor,
        new_task_run(ctx, &format!("{name}-"), spec),
        &ctx.options,
    )
    .await?;
    resolved(ctx, &run.name_any(), run.result(IMAGE_DIGEST_RESULT))
}

async fn pipeline(ctx: &BuildContext, url: &Url) -> Result<String> {
    let name = url.host_str().unwrap_or_default();
    if name.is_empty() {
        return Err(Error::MissingJobName {
            reference: url.to_string(),
            kind: "Pipeline",
            scheme: "pipeline",
        });
    }

    let definition = ctx.executor.get_pipeline(&ctx.namespace, name).await?;
    validate_contract(
        "Pipeline",
        name,
        &definition.spec.params,
        &definition.spec.results,
    )?;

    let mut run = PipelineRun::new(
        "",
        PipelineRunSpec {
            pipeline_ref: Some(JobRef {
                name: name.to_string(),
            }),
            params: contract_params(ctx, url),
            ..Default::default()
        },
    );
    run.metadata.name = None;
    run.metadata.generate_name = Some(format!("{name}-"));
    run.metadata.namespace = Some(ctx.namespace.clone());

    let run = runner::run_pipeline(&ctx.executor, run, &ctx.options).await?;
    resolved(ctx, &run.name_any(), run.result(IMAGE_DIGEST_RESULT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Pipeline as PipelineResource, PipelineSpec, Task as TaskResource};
    use crate::runner::fake::FakeExecutor;
    use assert_matches::assert_matches;

    const DIGEST: &str = "sha256:2e25a0687fe87783ec71298ed06b47307638e13a58a851c770bb6bb03f832b46";

    fn context(fake: Arc<FakeExecutor>) -> BuildContext {
        BuildContext {
            executor: fake,
            namespace: "default".to_string(),
            source_bundle: "gcr.io/mattmoor/bundle@sha256:feed".to_string(),
            image_target: "gcr.io/mattmoor/myimage:latest".to_string(),
            dockerfile: "Dockerfile".to_string(),
            kaniko_args: vec![],
            builder_image: DEFAULT_BUILDER_IMAGE.to_string(),
            overrides: vec![],
            options: vec![],
        }
    }

    fn parse(reference: &str) -> Url {
        Url::parse(reference).expect("valid directive")
    }

    fn complete_task() -> TaskResource {
        TaskResource::new(
            "build-thing",
            TaskSpec {
                params: vec![
                    ParamSpec {
                        name: SOURCE_BUNDLE_PARAM.to_string(),
                        ..Default::default()
                    },
                    ParamSpec {
                        name: IMAGE_TARGET_PARAM.to_string(),
                        ..Default::default()
                    },
                    ParamSpec {
                        name: "flags".to_string(),
                        ..Default::default()
                    },
                ],
                results: vec![ResultSpec {
                    name: IMAGE_DIGEST_RESULT.to_string(),
                    description: None,
                }],
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn dockerfile_resolves_to_target_at_digest() {
        let fake = Arc::new(FakeExecutor::succeeding(DIGEST));
        let ctx = context(fake.clone());

        let resolved = Builder::Dockerfile
            .build(&ctx, &parse("dockerfile:///"))
            .await
            .expect("builds");
        assert_eq!(
            resolved,
            format!("gcr.io/mattmoor/myimage:latest@{DIGEST}")
        );

        let run = fake.created_task_runs().pop().expect("one run");
        let steps = run.spec.task_spec.expect("inline spec").steps;
        assert_eq!(steps[0].image, "gcr.io/mattmoor/bundle@sha256:feed");
        assert!(steps[1]
            .args
            .contains(&"--destination=gcr.io/mattmoor/myimage:latest".to_string()));
        assert!(steps[1]
            .args
            .contains(&format!("--digest-file=/tekton/results/{IMAGE_DIGEST_RESULT}")));
    }

    #[tokio::test(start_paused = true)]
    async fn dockerfile_rejects_host_segment() {
        let fake = Arc::new(FakeExecutor::succeeding(DIGEST));
        let ctx = context(fake.clone());

        let err = Builder::Dockerfile
            .build(&ctx, &parse("dockerfile://app/Dockerfile"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::UnexpectedHost { ref suggestion, .. }
            if suggestion == "dockerfile:///app/Dockerfile");
        assert_eq!(fake.created_task_runs().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dockerfile_path_selects_the_dockerfile() {
        let fake = Arc::new(FakeExecutor::succeeding(DIGEST));
        let ctx = context(fake.clone());

        Builder::Dockerfile
            .build(&ctx, &parse("dockerfile:///app/Dockerfile.prod"))
            .await
            .expect("builds");

        let run = fake.created_task_runs().pop().expect("one run");
        let steps = run.spec.task_spec.expect("inline spec").steps;
        assert!(steps[1]
            .args
            .contains(&"--dockerfile=/workspace/app/Dockerfile.prod".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn buildpack_runs_the_lifecycle_phases() {
        let fake = Arc::new(FakeExecutor::succeeding(DIGEST));
        let ctx = context(fake.clone());

        Builder::Buildpack
            .build(&ctx, &parse("buildpack:///"))
            .await
            .expect("builds");

        let run = fake.created_task_runs().pop().expect("one run");
        let steps = run.spec.task_spec.expect("inline spec").steps;
        let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "extract-bundle",
                "detect",
                "analyze",
                "restore",
                "build",
                "export",
                "report"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ko_builds_the_import_path() {
        let fake = Arc::new(FakeExecutor::succeeding(DIGEST));
        let ctx = context(fake.clone());

        Builder::Ko
            .build(&ctx, &parse("ko://github.com/mattmoor/mink/cmd/mink"))
            .await
            .expect("builds");

        let run = fake.created_task_runs().pop().expect("one run");
        let steps = run.spec.task_spec.expect("inline spec").steps;
        assert!(steps[1].args[0].contains("ko build --bare github.com/mattmoor/mink/cmd/mink"));
        assert_eq!(
            steps[1].env[0].value.as_deref(),
            Some("gcr.io/mattmoor/myimage")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn task_passes_contract_and_query_params() {
        let fake = Arc::new(
            FakeExecutor::succeeding(DIGEST).with_task("build-thing", complete_task()),
        );
        let ctx = context(fake.clone());

        let resolved = Builder::Task
            .build(&ctx, &parse("task://build-thing?flags=--debug"))
            .await
            .expect("builds");
        assert_eq!(
            resolved,
            format!("gcr.io/mattmoor/myimage:latest@{DIGEST}")
        );

        let run = fake.created_task_runs().pop().expect("one run");
        let names: Vec<&str> = run.spec.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec![SOURCE_BUNDLE_PARAM, IMAGE_TARGET_PARAM, "flags"]);
    }

    #[tokio::test(start_paused = true)]
    async fn task_without_contract_never_submits() {
        let fake = Arc::new(
            FakeExecutor::succeeding(DIGEST)
                .with_task("incomplete", TaskResource::new("incomplete", TaskSpec::default())),
        );
        let ctx = context(fake.clone());

        let err = Builder::Task
            .build(&ctx, &parse("task://incomplete"))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains(r#"parameter "mink-source-bundle""#));
        assert!(message.contains(r#"parameter "mink-image-target""#));
        assert!(message.contains(r#"result "mink-image-digest""#));
        assert_eq!(fake.created_task_runs().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn task_missing_only_the_result_names_it() {
        let mut task = complete_task();
        task.spec.results.clear();
        let fake = Arc::new(FakeExecutor::succeeding(DIGEST).with_task("build-thing", task));
        let ctx = context(fake.clone());

        let err = Builder::Task
            .build(&ctx, &parse("task://build-thing"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"Task "build-thing" is missing: result "mink-image-digest""#
        );
        assert_eq!(fake.created_task_runs().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn task_requires_a_host() {
        let fake = Arc::new(FakeExecutor::succeeding(DIGEST));
        let ctx = context(fake.clone());

        let err = Builder::Task.build(&ctx, &parse("task:///")).await.unwrap_err();
        assert_matches!(err, Error::MissingJobName { kind: "Task", .. });
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_runs_by_reference() {
        let pipeline = PipelineResource::new(
            "deploy",
            PipelineSpec {
                params: vec![
                    ParamSpec {
                        name: SOURCE_BUNDLE_PARAM.to_string(),
                        ..Default::default()
                    },
                    ParamSpec {
                        name: IMAGE_TARGET_PARAM.to_string(),
                        ..Default::default()
                    },
                ],
                results: vec![ResultSpec {
                    name: IMAGE_DIGEST_RESULT.to_string(),
                    description: None,
                }],
                ..Default::default()
            },
        );
        let fake = Arc::new(FakeExecutor::succeeding(DIGEST).with_pipeline("deploy", pipeline));
        let ctx = context(fake.clone());

        let resolved = Builder::Pipeline
            .build(&ctx, &parse("pipeline://deploy"))
            .await
            .expect("builds");
        assert_eq!(
            resolved,
            format!("gcr.io/mattmoor/myimage:latest@{DIGEST}")
        );
    }

    #[test]
    fn table_registers_every_scheme() {
        let table = Builder::table();
        for scheme in ["dockerfile", "buildpack", "ko", "task", "pipeline"] {
            assert!(table.contains_key(scheme), "missing scheme {scheme}");
        }
        assert_eq!(table.len(), 5);
    }
}
