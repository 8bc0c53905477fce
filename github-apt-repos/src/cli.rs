// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    apt_repo_builder::{
        config::BuilderConfig,
        error::{BuildError, Phase},
        event::{BuildEvent, EventSink},
        orchestrator::{BuildOptions, Orchestrator},
        signing_key::KeyStore,
    },
    clap::{Arg, ArgMatches, Command},
    log::{warn, LevelFilter},
    std::{
        path::PathBuf,
        str::FromStr,
        sync::{Arc, Mutex},
    },
    thiserror::Error,
    tokio_util::sync::CancellationToken,
};

const BUILD_ABOUT: &str = "\
Build an APT repository from the .deb assets of a release.

The .deb files attached to a release are downloaded into a local cache,
indexed into Packages files, assembled into a pool/ and dists/ tree,
signed and published to the destination directory or GitHub release.

Each phase skips work whose inputs didn't change. Running a build twice
against the same release downloads nothing the second time and leaves
the published repository untouched.

# YAML Configuration

repo_source (required) (string)
   Where releases come from. `github:<owner>/<repo>`,
   `https://github.com/<owner>/<repo>`, `git@github.com:<owner>/<repo>.git`,
   `file://<path>` or a plain directory path.

release (optional) (string)
   Release tag to build from. Defaults to `latest`.

destination (optional) (string)
   Directory to publish the repository to, or `github:<owner>/<repo>[@<tag>]`
   to publish to the assets of a release (tag defaults to `apt-<codename>`).
   Without one, the repository is only assembled in the work directory.

layout (optional) (string)
   `pool` for the usual pool/ and dists/ tree or `flat` to put every file at
   the repository root. GitHub release destinations are always flat.

codename, suite, origin, label, description (optional) (string)
   Release metadata.

components, architectures (optional) (list[string])
   Components default to `main`. Architectures are discovered from the
   packages when not given.

sign (optional) (bool)
   Whether to sign the repository. Defaults to true. The key at
   `gpg_key_path` is generated on first use unless
   `generate_key_if_missing` is false.

delete_existing_published (optional) (bool)
   Remove published files that the new repository doesn't contain.

See the library documentation for the complete list of keys.

# Exit Codes

0 success, 1 configuration error, 2 fetch, 3 index, 4 assemble, 5 sign,
6 publish, 130 cancelled.
";

#[derive(Debug, Error)]
pub enum CliError {
    #[error("argument parsing error: {0}")]
    Clap(#[from] clap::Error),

    #[error("{0}")]
    Build(#[from] BuildError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Build(e) => e.exit_code(),
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, CliError>;

fn config_args(command: Command<'static>) -> Command<'static> {
    command
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Path to a YAML file defining the build configuration"),
        )
        .arg(
            Arg::new("source")
                .long("source")
                .takes_value(true)
                .help("Release source; overrides repo_source"),
        )
}

pub async fn run_cli() -> Result<()> {
    let app = Command::new("github-apt-repos")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Build signed APT repositories from release assets")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(config_args(
        Command::new("build")
            .about("Build and publish a repository")
            .long_about(BUILD_ABOUT)
            .arg(
                Arg::new("release")
                    .long("release")
                    .takes_value(true)
                    .help("Release tag to build from, or `latest`"),
            )
            .arg(
                Arg::new("destination")
                    .long("destination")
                    .takes_value(true)
                    .help("Directory or `github:<owner>/<repo>[@<tag>]` release to publish to"),
            )
            .arg(
                Arg::new("through")
                    .long("through")
                    .takes_value(true)
                    .possible_values(["fetch", "index", "assemble", "sign", "publish"])
                    .help("Last phase to run"),
            )
            .arg(
                Arg::new("dry-run")
                    .long("dry-run")
                    .help("Report what publishing would change without changing anything"),
            )
            .arg(
                Arg::new("offline")
                    .long("offline")
                    .help("Reuse the assets of the previous fetch instead of contacting the source"),
            )
            .arg(
                Arg::new("concurrency")
                    .long("concurrency")
                    .takes_value(true)
                    .help("Maximum number of concurrent transfers"),
            ),
    ));

    let app = app.subcommand(config_args(
        Command::new("public-key").about("Print the armored public key of the signing key"),
    ));

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    for module in ["rustls", "hyper", "reqwest"] {
        builder.filter_module(module, LevelFilter::Warn);
    }

    builder.init();

    match matches.subcommand() {
        Some(("build", args)) => command_build(args).await,
        Some(("public-key", args)) => command_public_key(args),
        Some((command, _)) => Err(CliError::InvalidArgument(format!(
            "unknown command: {}",
            command
        ))),
        None => Err(CliError::InvalidArgument("no command given".into())),
    }
}

fn load_config(args: &ArgMatches) -> Result<BuilderConfig> {
    let mut config = match (args.value_of_os("config"), args.value_of("source")) {
        (Some(path), _) => BuilderConfig::from_path(PathBuf::from(path))?,
        (None, Some(source)) => BuilderConfig::new(source),
        (None, None) => {
            return Err(CliError::InvalidArgument(
                "one of --config or --source is required".into(),
            ))
        }
    };

    if let Some(source) = args.value_of("source") {
        config.repo_source = source.to_string();
    }

    Ok(config)
}

fn progress_events() -> EventSink {
    let bar: Arc<Mutex<Option<pbr::ProgressBar<std::io::Stdout>>>> = Arc::new(Mutex::new(None));

    EventSink::new(Arc::new(move |event: BuildEvent| {
        let mut guard = match bar.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        match event {
            BuildEvent::FetchPlanned { assets } if assets > 0 => {
                let mut pb = pbr::ProgressBar::new(assets as u64);
                pb.message("fetching ");
                guard.replace(pb);
            }
            BuildEvent::AssetFetched { .. } => {
                if let Some(pb) = guard.as_mut() {
                    pb.inc();
                }
            }
            BuildEvent::UploadPlanned { files, bytes } if files > 0 => {
                let mut pb = pbr::ProgressBar::new(bytes);
                pb.set_units(pbr::Units::Bytes);
                pb.message("uploading ");
                guard.replace(pb);
            }
            BuildEvent::FileUploaded { size, .. } => {
                if let Some(pb) = guard.as_mut() {
                    pb.add(size);
                }
            }
            BuildEvent::PhaseFinished(_) => {
                if let Some(mut pb) = guard.take() {
                    pb.finish();
                    println!();
                }
            }
            _ => {}
        }
    }))
}

async fn command_build(args: &ArgMatches) -> Result<()> {
    let mut config = load_config(args)?;

    if let Some(release) = args.value_of("release") {
        config.release = release.to_string();
    }
    if let Some(destination) = args.value_of("destination") {
        config.destination = Some(destination.to_string());
    }
    if args.is_present("concurrency") {
        config.concurrency = args.value_of_t::<usize>("concurrency")?;
    }

    let options = BuildOptions {
        run_through: match args.value_of("through") {
            Some(phase) => Phase::from_str(phase)
                .map_err(|_| CliError::InvalidArgument(format!("unknown phase: {}", phase)))?,
            None => Phase::Publish,
        },
        dry_run: args.is_present("dry-run"),
        offline: args.is_present("offline"),
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted; stopping after in-flight transfers");
                cancel.cancel();
            }
        });
    }

    let orchestrator = Orchestrator::from_config(config)?
        .with_cancellation(cancel)
        .with_events(progress_events());

    let report = orchestrator.run(&options).await?;
    print!("{}", report);

    Ok(())
}

fn command_public_key(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    config.validate()?;

    let store = KeyStore::new(config.key_path());
    let key = store
        .load(config.passphrase().as_deref())
        .map_err(BuildError::from)?;

    print!("{}", key.public_key_armored());

    Ok(())
}
