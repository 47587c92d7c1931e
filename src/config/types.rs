//! Core types shared by the launcher, the supervisor and the CLI.

use std::ffi::{CStr, CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Exit status used for every fatal condition of the supervisor itself and
/// for launch failures inside the child.
pub const EXIT_FAILURE: i32 = 1;

/// Base name of the running binary, used as the diagnostic prefix.
pub fn program_name() -> String {
    std::env::args_os()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "quickjail".to_string())
}

/// A single `name=value` jail setting as given on the command line.
///
/// Values are raw bytes: paths and command words need not be UTF-8.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JailSetting {
    pub name: String,
    pub value: OsString,
}

impl JailSetting {
    pub fn new(name: impl Into<String>, value: impl Into<OsString>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Split `name=value` at the first `=` byte.
    pub fn parse(arg: &OsStr) -> Result<Self> {
        let bytes = arg.as_bytes();
        let Some(eq) = bytes.iter().position(|&b| b == b'=') else {
            return Err(JailError::Usage(format!(
                "malformed setting, missing '=': {}",
                arg.to_string_lossy()
            )));
        };
        let name = std::str::from_utf8(&bytes[..eq]).map_err(|_| {
            JailError::Parameter(format!(
                "invalid jail parameter: {}",
                String::from_utf8_lossy(&bytes[..eq])
            ))
        })?;
        Ok(Self::new(name, OsStr::from_bytes(&bytes[eq + 1..])))
    }
}

/// Ordered jail settings. Duplicates are kept; the kernel decides what a
/// repeated name means.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParameterSet {
    settings: Vec<JailSetting>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, setting: JailSetting) {
        self.settings.push(setting);
    }

    pub fn iter(&self) -> impl Iterator<Item = &JailSetting> {
        self.settings.iter()
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// Value of the last setting with this name, if any.
    pub fn get(&self, name: &str) -> Option<&OsStr> {
        self.settings
            .iter()
            .rev()
            .find(|s| s.name == name)
            .map(|s| s.value.as_os_str())
    }
}

impl FromIterator<JailSetting> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = JailSetting>>(iter: I) -> Self {
        Self {
            settings: iter.into_iter().collect(),
        }
    }
}

/// Directory the child moves into before the jail is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Workdir {
    /// Stay in the directory inherited from the supervisor.
    Unchanged,
    Path(PathBuf),
}

impl Workdir {
    /// `None` and `.` both mean "stay where we are".
    pub fn from_option(path: Option<&OsStr>) -> Self {
        match path {
            None => Workdir::Unchanged,
            Some(p) if p == "." => Workdir::Unchanged,
            Some(p) => Workdir::Path(PathBuf::from(p)),
        }
    }
}

/// Everything the supervisor needs to launch one jailed command.
///
/// The argv is converted to C strings up front so the child does not have to
/// validate anything between fork and exec. Arguments are passed through as
/// bytes. A request always has a non-empty program name.
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    params: ParameterSet,
    workdir: Workdir,
    program: CString,
    argv: Vec<CString>,
}

impl LaunchRequest {
    pub fn new(params: ParameterSet, workdir: Workdir, command: &[OsString]) -> Result<Self> {
        let argv = command
            .iter()
            .map(|arg| {
                CString::new(arg.as_bytes()).map_err(|_| {
                    JailError::Usage(format!(
                        "command argument contains NUL byte: {}",
                        arg.to_string_lossy()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let program = match argv.first() {
            Some(first) if !first.as_bytes().is_empty() => first.clone(),
            _ => return Err(JailError::Usage("missing command".to_string())),
        };

        Ok(Self {
            params,
            workdir,
            program,
            argv,
        })
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn workdir(&self) -> &Workdir {
        &self.workdir
    }

    /// Full argument vector, program name first.
    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    pub fn program(&self) -> &CStr {
        &self.program
    }
}

/// Error taxonomy for quickjail. Every variant renders as a one-line
/// diagnostic naming the operation that failed.
#[derive(Error, Debug)]
pub enum JailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed invocation; reported together with the usage text.
    #[error("{0}")]
    Usage(String),

    /// A setting that could not be resolved or encoded for the kernel.
    #[error("{0}")]
    Parameter(String),

    /// Parent-side failure once a child exists; the child is killed first.
    #[error("{op}: {detail}")]
    Launch { op: &'static str, detail: String },

    /// Fatal step inside the child before or instead of exec.
    #[error("{op}: {detail}")]
    Child { op: &'static str, detail: String },

    /// Failure while waiting for or decoding the exit event.
    #[error("{op}: {detail}")]
    Monitor { op: &'static str, detail: String },

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl JailError {
    pub fn launch(op: &'static str, err: impl std::fmt::Display) -> Self {
        JailError::Launch {
            op,
            detail: err.to_string(),
        }
    }

    pub fn child(op: &'static str, err: impl std::fmt::Display) -> Self {
        JailError::Child {
            op,
            detail: err.to_string(),
        }
    }

    pub fn monitor(op: &'static str, err: impl std::fmt::Display) -> Self {
        JailError::Monitor {
            op,
            detail: err.to_string(),
        }
    }

    /// Usage errors are the only ones that print the usage text.
    pub fn is_usage(&self) -> bool {
        matches!(self, JailError::Usage(_))
    }
}

pub type Result<T> = std::result::Result<T, JailError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::ffi::OsStringExt;

    fn os(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn setting_splits_at_first_equals() {
        let setting = JailSetting::parse(OsStr::new("host.hostname=a=b")).unwrap();
        assert_eq!(setting.name, "host.hostname");
        assert_eq!(setting.value, "a=b");
    }

    #[test]
    fn setting_without_equals_is_usage_error() {
        let err = JailSetting::parse(OsStr::new("persist")).unwrap_err();
        assert!(err.is_usage());
        assert_eq!(err.to_string(), "malformed setting, missing '=': persist");
    }

    #[test]
    fn setting_with_empty_value_is_kept() {
        let setting = JailSetting::parse(OsStr::new("persist=")).unwrap();
        assert_eq!(setting, JailSetting::new("persist", ""));
    }

    #[test]
    fn setting_value_keeps_non_utf8_bytes() {
        let setting = JailSetting::parse(OsStr::from_bytes(b"path=/jails/\xff")).unwrap();
        assert_eq!(setting.name, "path");
        assert_eq!(setting.value.as_bytes(), b"/jails/\xff");
    }

    #[test]
    fn setting_name_must_be_utf8() {
        let err = JailSetting::parse(OsStr::from_bytes(b"na\xffme=x")).unwrap_err();
        assert!(!err.is_usage());
        assert!(err.to_string().starts_with("invalid jail parameter: "));
    }

    #[test]
    fn dot_workdir_means_unchanged() {
        assert_eq!(Workdir::from_option(Some(OsStr::new("."))), Workdir::Unchanged);
        assert_eq!(Workdir::from_option(None), Workdir::Unchanged);
        assert_eq!(
            Workdir::from_option(Some(OsStr::new("/jails/www"))),
            Workdir::Path(PathBuf::from("/jails/www"))
        );
    }

    #[test]
    fn parameter_set_keeps_order_and_duplicates() {
        let params: ParameterSet = vec![
            JailSetting::new("name", "a"),
            JailSetting::new("path", "/"),
            JailSetting::new("name", "b"),
        ]
        .into_iter()
        .collect();

        assert_eq!(params.len(), 3);
        assert!(!params.is_empty());
        let names: Vec<&str> = params.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["name", "path", "name"]);
        assert_eq!(params.get("name"), Some(OsStr::new("b")));
        assert_eq!(params.get("persist"), None);
    }

    #[test]
    fn launch_request_rejects_empty_command() {
        let err = LaunchRequest::new(ParameterSet::new(), Workdir::Unchanged, &[]).unwrap_err();
        assert!(err.is_usage());

        let err = LaunchRequest::new(ParameterSet::new(), Workdir::Unchanged, &os(&["", "arg"]))
            .unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn launch_request_rejects_nul_bytes() {
        let err = LaunchRequest::new(ParameterSet::new(), Workdir::Unchanged, &os(&["a\0b"]))
            .unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn launch_request_keeps_argv_bytes() {
        let command = vec![OsString::from("ls"), OsString::from_vec(b"file\xff".to_vec())];
        let req = LaunchRequest::new(ParameterSet::new(), Workdir::Unchanged, &command).unwrap();
        assert_eq!(req.program().to_bytes(), b"ls");
        assert_eq!(req.argv().len(), 2);
        assert_eq!(req.argv()[1].as_bytes(), b"file\xff");
        assert!(req.params().is_empty());
        assert_eq!(req.workdir(), &Workdir::Unchanged);
    }

    #[test]
    fn program_name_is_a_base_name() {
        let name = program_name();
        assert!(!name.is_empty());
        assert!(!name.contains('/'));
    }

    #[test]
    fn diagnostics_name_the_operation() {
        let err = JailError::launch("kqueue", "Too many open files");
        assert_eq!(err.to_string(), "kqueue: Too many open files");
        assert!(!err.is_usage());
    }
}
