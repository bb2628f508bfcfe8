//! The command-line surface of a workflow.
//!
//! A [`Configuration`] carries the engine's default options (parallelism,
//! selection filters, skip control, grid choice) plus any user-declared
//! options, built on the `clap` builder API so options can be added at
//! runtime. Parsed values feed [`crate::workflow::GoOptions`].

use std::{sync::Arc, time::Duration};

use camino::Utf8PathBuf;
use clap::{Arg, ArgAction, ArgMatches, Command};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::workflow::GoOptions;
use anadama_grid::{GridQueue, SgeQueue, SlurmQueue};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("command line arguments have not been parsed yet")]
    NotParsed,
    #[error("unknown grid backend `{0}`; expected slurm or sge")]
    UnknownGrid(String),
    #[error(transparent)]
    Clap(#[from] clap::Error),
}

pub struct Configuration {
    command: Command,
    matches: Option<ArgMatches>,
}

impl Configuration {
    /// A configuration with the engine's default options installed.
    pub fn new(name: &str, description: Option<&str>, version: Option<&str>) -> Self {
        let mut command = Command::new(name.to_owned());
        if let Some(description) = description {
            command = command.about(description.to_owned());
        }
        if let Some(version) = version {
            command = command.version(version.to_owned());
        }
        command = command
            .arg(
                Arg::new("input")
                    .short('i')
                    .long("input")
                    .value_name("DIR")
                    .help("Collect inputs from this directory"),
            )
            .arg(
                Arg::new("output")
                    .short('o')
                    .long("output")
                    .value_name("DIR")
                    .help(
                        "Store output in this directory. By default the dependency \
                         database and run log are also put in this directory",
                    ),
            )
            .arg(
                Arg::new("jobs")
                    .short('j')
                    .long("jobs")
                    .value_name("N")
                    .default_value("1")
                    .value_parser(clap::value_parser!(usize))
                    .help("The number of tasks to execute in parallel locally"),
            )
            .arg(
                Arg::new("grid_jobs")
                    .short('J')
                    .long("grid-jobs")
                    .value_name("N")
                    .default_value("1")
                    .value_parser(clap::value_parser!(usize))
                    .help("The number of tasks to submit to the grid in parallel"),
            )
            .arg(
                Arg::new("dry_run")
                    .short('d')
                    .long("dry-run")
                    .action(ArgAction::SetTrue)
                    .help("Print tasks to be run but don't execute their actions"),
            )
            .arg(
                Arg::new("run_them_all")
                    .short('a')
                    .long("run-them-all")
                    .action(ArgAction::SetTrue)
                    .help("Skip no tasks; run it all"),
            )
            .arg(
                Arg::new("quit_early")
                    .short('e')
                    .long("quit-early")
                    .action(ArgAction::SetTrue)
                    .help("If any tasks fail, stop all execution immediately"),
            )
            .arg(
                Arg::new("until_task")
                    .short('u')
                    .long("until-task")
                    .value_name("NAME|NO")
                    .action(ArgAction::Append)
                    .help("Stop after running the named or numbered task"),
            )
            .arg(
                Arg::new("exclude_task")
                    .short('U')
                    .long("exclude-task")
                    .value_name("NAME|NO")
                    .action(ArgAction::Append)
                    .help("Don't execute these tasks or their descendants"),
            )
            .arg(
                Arg::new("target")
                    .short('t')
                    .long("target")
                    .value_name("PATTERN")
                    .action(ArgAction::Append)
                    .help(
                        "Only execute tasks that make these targets. Values \
                         containing `?', `*' or `[' are treated as patterns",
                    ),
            )
            .arg(
                Arg::new("exclude_target")
                    .short('T')
                    .long("exclude-target")
                    .value_name("PATTERN")
                    .action(ArgAction::Append)
                    .help("Don't execute tasks that make these targets"),
            )
            .arg(
                Arg::new("deploy")
                    .long("deploy")
                    .action(ArgAction::SetTrue)
                    .help("Create directories used by other options and exit"),
            )
            .arg(
                Arg::new("grid")
                    .long("grid")
                    .value_name("BACKEND")
                    .help("Run gridable tasks on this backend (slurm or sge)"),
            )
            .arg(
                Arg::new("grid_partition")
                    .long("grid-partition")
                    .value_name("NAME")
                    .help("Partition or queue to submit grid tasks to"),
            )
            .arg(
                Arg::new("grid_options")
                    .long("grid-options")
                    .value_name("OPTION")
                    .action(ArgAction::Append)
                    .help("Extra scheduler options applied to each grid job"),
            )
            .arg(
                Arg::new("grid_environment")
                    .long("grid-environment")
                    .value_name("COMMAND")
                    .action(ArgAction::Append)
                    .help("Environment setup commands run before each grid job"),
            )
            .arg(
                Arg::new("log_level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .default_value("info")
                    .help("Run log verbosity (trace, debug, info, warn, error)"),
            );

        Self {
            command,
            matches: None,
        }
    }

    /// Declare an additional string-valued option.
    pub fn add(
        mut self,
        name: &str,
        short: Option<char>,
        help: &str,
        default: Option<&str>,
    ) -> Self {
        let mut arg = Arg::new(name.to_owned())
            .long(name.to_owned())
            .help(help.to_owned());
        if let Some(short) = short {
            arg = arg.short(short);
        }
        if let Some(default) = default {
            arg = arg.default_value(default.to_owned());
        }
        self.command = self.command.arg(arg);
        self
    }

    /// Declare an additional boolean flag.
    pub fn add_flag(mut self, name: &str, short: Option<char>, help: &str) -> Self {
        let mut arg = Arg::new(name.to_owned())
            .long(name.to_owned())
            .help(help.to_owned())
            .action(ArgAction::SetTrue);
        if let Some(short) = short {
            arg = arg.short(short);
        }
        self.command = self.command.arg(arg);
        self
    }

    /// Parse the process arguments, exiting with usage on error, like
    /// any CLI would.
    pub fn parse(&mut self) {
        self.matches = Some(self.command.clone().get_matches());
    }

    /// Parse an explicit argument list; the first element is the binary
    /// name.
    pub fn parse_from<I, S>(&mut self, args: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString> + Clone,
    {
        self.matches = Some(self.command.clone().try_get_matches_from(args)?);
        Ok(())
    }

    fn matches(&self) -> Result<&ArgMatches, ConfigError> {
        self.matches.as_ref().ok_or(ConfigError::NotParsed)
    }

    pub fn string(&self, name: &str) -> Option<String> {
        self.matches
            .as_ref()?
            .get_one::<String>(name)
            .map(String::to_owned)
    }

    pub fn strings(&self, name: &str) -> Vec<String> {
        self.matches
            .as_ref()
            .and_then(|m| m.get_many::<String>(name))
            .map(|vals| vals.map(String::to_owned).collect())
            .unwrap_or_default()
    }

    pub fn flag(&self, name: &str) -> bool {
        self.matches
            .as_ref()
            .map(|m| m.get_flag(name))
            .unwrap_or(false)
    }

    pub fn number(&self, name: &str) -> Option<usize> {
        self.matches.as_ref()?.get_one::<usize>(name).copied()
    }

    pub fn input_dir(&self) -> Option<Utf8PathBuf> {
        self.string("input").map(Utf8PathBuf::from)
    }

    pub fn output_dir(&self) -> Option<Utf8PathBuf> {
        self.string("output").map(Utf8PathBuf::from)
    }

    pub fn deploy_requested(&self) -> bool {
        self.flag("deploy")
    }

    /// Create the declared input and output directories. Callers invoke
    /// this and exit 0 when `--deploy` was given.
    pub fn deploy(&self) -> std::io::Result<()> {
        for dir in [self.input_dir(), self.output_dir()].into_iter().flatten() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Build the grid driver selected on the command line, if any.
    pub fn grid(&self) -> Result<Option<Arc<dyn GridQueue>>, ConfigError> {
        let Some(backend) = self.string("grid") else {
            return Ok(None);
        };
        let partition = self.string("grid_partition").unwrap_or_default();
        let options = self.strings("grid_options");
        let environment = self.strings("grid_environment");
        let queue: Arc<dyn GridQueue> = match backend.as_str() {
            "slurm" => Arc::new(
                SlurmQueue::new(partition)
                    .with_options(options)
                    .with_environment(environment)
                    .with_refresh_rate(Duration::from_secs(10)),
            ),
            "sge" => Arc::new(
                SgeQueue::new(partition)
                    .with_options(options)
                    .with_environment(environment)
                    .with_refresh_rate(Duration::from_secs(10)),
            ),
            other => return Err(ConfigError::UnknownGrid(other.to_owned())),
        };
        Ok(Some(queue))
    }

    /// Translate the parsed flags into run options.
    pub fn go_options(&self) -> Result<GoOptions, ConfigError> {
        let _ = self.matches()?;
        Ok(GoOptions {
            skip_nothing: self.flag("run_them_all"),
            quit_early: self.flag("quit_early"),
            jobs: self.number("jobs").unwrap_or(1),
            grid_jobs: self.number("grid_jobs").unwrap_or(1),
            until_task: self.strings("until_task"),
            exclude_task: self.strings("exclude_task"),
            target: self.strings("target"),
            exclude_target: self.strings("exclude_target"),
            dry_run: self.flag("dry_run"),
            output: self.output_dir(),
            grid: self.grid()?,
            ..GoOptions::default()
        })
    }
}

/// Install the run-log subscriber: human-readable lines on stderr,
/// filtered by `RUST_LOG` or the given level. Safe to call twice; the
/// second call is a no-op.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_owned()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Like [`init_logging`], but append the run log to a file, typically
/// `<output>/anadama.log`.
pub fn init_logging_to_file(level: &str, log_file: &Utf8PathBuf) -> std::io::Result<()> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_owned()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(move || file.try_clone().expect("log file handle"))
        .try_init();
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parsed(args: &[&str]) -> Configuration {
        let mut config = Configuration::new("wf", Some("test workflow"), Some("1.0"));
        let mut argv = vec!["wf"];
        argv.extend(args);
        config.parse_from(argv).unwrap();
        config
    }

    #[test]
    fn defaults_apply() {
        let config = parsed(&[]);
        let opts = config.go_options().unwrap();
        assert_eq!(opts.jobs, 1);
        assert_eq!(opts.grid_jobs, 1);
        assert!(!opts.quit_early);
        assert!(!opts.skip_nothing);
        assert!(opts.target.is_empty());
    }

    #[test]
    fn short_flags_parse() {
        let config = parsed(&["-j", "4", "-e", "-a", "-t", "out/*.txt", "-t", "log/c.txt"]);
        let opts = config.go_options().unwrap();
        assert_eq!(opts.jobs, 4);
        assert!(opts.quit_early);
        assert!(opts.skip_nothing);
        assert_eq!(opts.target, vec!["out/*.txt", "log/c.txt"]);
    }

    #[test]
    fn user_options_are_available() {
        let mut config = Configuration::new("wf", None, None)
            .add("reference", Some('r'), "Reference database", Some("refdb"))
            .add_flag("paired", None, "Paired-end input");
        config.parse_from(["wf", "--paired"]).unwrap();
        assert_eq!(config.string("reference").as_deref(), Some("refdb"));
        assert!(config.flag("paired"));
    }

    #[test]
    fn unknown_grid_backend_is_rejected() {
        let config = parsed(&["--grid", "mainframe"]);
        assert!(matches!(
            config.grid(),
            Err(ConfigError::UnknownGrid(name)) if name == "mainframe"
        ));
    }
}
