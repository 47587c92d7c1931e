use crate::config::types::{
    program_name, JailError, JailSetting, LaunchRequest, ParameterSet, Workdir, EXIT_FAILURE,
};
use crate::core::supervisor;
use crate::kernel::jail;
use anyhow::Result;
use clap::Parser;
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;

/// Which command-line grammar a binary speaks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CliMode {
    /// `quickjail [-c] [param=value ...] command=<cmd> [args...]`
    Params,
    /// `qjail [-n name] [-p path] <cmd> [args...]`
    Flags,
}

impl CliMode {
    fn usage(self) -> &'static str {
        match self {
            Self::Params => "usage: quickjail [-c] [param=value ...] command=command ...",
            Self::Flags => "usage: qjail [-n name] [-p path] command ...",
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "quickjail",
    version,
    about = "Run a command in a new, non-persistent jail",
    override_usage = "quickjail [-c] [param=value ...] command=command ..."
)]
struct ParamsCli {
    /// Accepted for jail(8) compatibility and ignored
    #[arg(short = 'c')]
    create: bool,
    /// Jail parameters, then command=<cmd> followed by its arguments
    #[arg(trailing_var_arg = true, num_args = 1.., value_name = "param=value")]
    settings: Vec<OsString>,
}

#[derive(Parser, Debug)]
#[command(
    name = "qjail",
    version,
    about = "Run a command in a new, non-persistent jail",
    override_usage = "qjail [-n name] [-p path] command ..."
)]
struct FlagsCli {
    /// Jail name
    #[arg(short = 'n', value_name = "name")]
    name: Option<OsString>,
    /// Jail root, also the command's working directory
    #[arg(short = 'p', value_name = "path", default_value = "/")]
    path: OsString,
    /// Command and arguments to execute
    #[arg(trailing_var_arg = true, num_args = 1.., value_name = "command")]
    command: Vec<OsString>,
}

/// A parsed invocation, before any kernel validation.
#[derive(Debug, PartialEq, Eq)]
pub struct Invocation {
    pub params: ParameterSet,
    pub workdir: Workdir,
    pub command: Vec<OsString>,
}

impl Invocation {
    /// Walk `param=value` settings up to the first `command=`. The last
    /// `path=` before it is also the working directory.
    pub fn from_settings(settings: &[OsString]) -> crate::Result<Self> {
        let mut params = ParameterSet::new();

        for (idx, arg) in settings.iter().enumerate() {
            let setting = JailSetting::parse(arg)?;
            if setting.name == "command" {
                if setting.value.as_bytes().is_empty() {
                    return Err(JailError::Usage("command must not be empty".to_string()));
                }
                let mut command = vec![setting.value];
                command.extend(settings[idx + 1..].iter().cloned());
                return Ok(Self {
                    workdir: Workdir::from_option(params.get("path")),
                    params,
                    command,
                });
            }
            params.push(setting);
        }

        Err(JailError::Usage("missing command".to_string()))
    }

    fn from_flags(cli: FlagsCli) -> Self {
        let mut params = ParameterSet::new();
        if let Some(name) = cli.name {
            params.push(JailSetting::new("name", name));
        }
        params.push(JailSetting::new("path", cli.path));
        Self {
            workdir: Workdir::from_option(params.get("path")),
            params,
            command: cli.command,
        }
    }

    pub fn into_request(self) -> crate::Result<LaunchRequest> {
        LaunchRequest::new(self.params, self.workdir, &self.command)
    }
}

enum Parsed {
    /// clap already answered (help, version or a syntax error)
    Exit(i32),
    Launch(Invocation),
}

fn parse<I, T>(mode: CliMode, args: I) -> crate::Result<Parsed>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let clap_exit = |e: clap::Error| {
        let _ = e.print();
        Parsed::Exit(if e.use_stderr() { EXIT_FAILURE } else { 0 })
    };

    match mode {
        CliMode::Params => match ParamsCli::try_parse_from(args) {
            Ok(cli) => {
                if cli.create {
                    log::debug!("-c given; jails are always created");
                }
                Invocation::from_settings(&cli.settings).map(Parsed::Launch)
            }
            Err(e) => Ok(clap_exit(e)),
        },
        CliMode::Flags => match FlagsCli::try_parse_from(args) {
            Ok(cli) => Ok(Parsed::Launch(Invocation::from_flags(cli))),
            Err(e) => Ok(clap_exit(e)),
        },
    }
}

/// `RUST_LOG` overrides the default `warn` filter.
fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("warn");
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .try_init();
}

/// Parse `args`, validate the parameters and supervise the command. Returns
/// the exit code the process should end with.
pub fn execute<I, T>(mode: CliMode, args: I) -> Result<i32>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let invocation = match parse(mode, args)? {
        Parsed::Exit(code) => return Ok(code),
        Parsed::Launch(invocation) => invocation,
    };
    let request = invocation.into_request()?;
    let params = jail::import(request.params())?;
    let status = supervisor::run(&request, &params)?;
    Ok(status.code())
}

/// Entry point shared by the `quickjail` and `qjail` binaries.
pub fn run(mode: CliMode) -> i32 {
    init_logging();
    match execute(mode, std::env::args_os()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}: {:#}", program_name(), err);
            if err
                .downcast_ref::<JailError>()
                .is_some_and(JailError::is_usage)
            {
                eprintln!("{}", mode.usage());
            }
            EXIT_FAILURE
        }
    }
}
