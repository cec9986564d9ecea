//! Task command construction
//!
//! A task command starts life as a template such as
//!
//! ```text
//! $AZ_BATCH_NODE_SHARED_DIR/{task_file} --filepath {file_path} --idx {idx}
//! ```
//!
//! which is rendered with per-task parameters and then wrapped for the
//! shell of the node OS:
//!
//! - linux: `/bin/bash -c 'set -e; set -o pipefail; c1;c2; wait'`
//! - windows: `cmd.exe /c "c1&c2"`
//!
//! Access tokens are passed as ordinary parameters and end up on the command
//! line; the task process receives nothing else from the platform.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Node operating system family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Windows => "windows",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" | "posix" => Ok(Platform::Linux),
            "windows" => Ok(Platform::Windows),
            _ => Err(CommandError::UnsupportedPlatform(s.to_string())),
        }
    }
}

/// Command construction errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unsupported platform '{0}': expected linux or windows")]
    UnsupportedPlatform(String),

    #[error("template references unknown parameter '{{{0}}}'")]
    UnknownParameter(String),

    #[error("no commands to wrap")]
    Empty,
}

/// Named values substituted into a template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    values: BTreeMap<String, String>,
}

impl TaskParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.values.insert(name.into(), value.to_string());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl ToString) {
        self.values.insert(name.into(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Copy every value of `other` over this set
    pub fn extend(&mut self, other: &TaskParams) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    })
}

/// A single command template with `{name}` placeholders
///
/// `{{` and `}}` produce literal braces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(String);

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Names referenced by the template, in order of first use
    pub fn placeholders(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for caps in placeholder_pattern().captures_iter(&self.0) {
            if let Some(name) = caps.get(1) {
                if !names.iter().any(|n| n == name.as_str()) {
                    names.push(name.as_str().to_string());
                }
            }
        }
        names
    }

    /// Substitute every placeholder
    pub fn render(&self, params: &TaskParams) -> Result<String, CommandError> {
        let mut out = String::with_capacity(self.0.len());
        let mut last = 0;

        for caps in placeholder_pattern().captures_iter(&self.0) {
            let whole = caps.get(0).expect("group 0 always matches");
            out.push_str(&self.0[last..whole.start()]);
            match caps.get(1) {
                Some(name) => {
                    let value = params
                        .get(name.as_str())
                        .ok_or_else(|| CommandError::UnknownParameter(name.as_str().to_string()))?;
                    out.push_str(value);
                }
                None => out.push_str(&whole.as_str()[..1]),
            }
            last = whole.end();
        }
        out.push_str(&self.0[last..]);

        Ok(out)
    }
}

/// Join commands into one invocation of the node shell
pub fn wrap_commands_in_shell(platform: Platform, commands: &[String]) -> Result<String, CommandError> {
    if commands.is_empty() {
        return Err(CommandError::Empty);
    }

    let wrapped = match platform {
        Platform::Linux => {
            let joined = commands.join(";").replace('\'', r"'\''");
            format!("/bin/bash -c 'set -e; set -o pipefail; {}; wait'", joined)
        }
        Platform::Windows => format!("cmd.exe /c \"{}\"", commands.join("&")),
    };
    Ok(wrapped)
}

/// Render `template` with `params` and wrap it for `platform`
///
/// The platform is checked before anything else, so an unsupported value
/// fails without rendering.
pub fn build_command(
    platform: &str,
    template: &CommandTemplate,
    params: &TaskParams,
) -> Result<String, CommandError> {
    let platform: Platform = platform.parse()?;
    let rendered = template.render(params)?;
    wrap_commands_in_shell(platform, &[rendered])
}

/// Render several templates and wrap them as one command line
pub fn build_command_sequence(
    platform: Platform,
    templates: &[CommandTemplate],
    params: &TaskParams,
) -> Result<String, CommandError> {
    let rendered = templates
        .iter()
        .map(|t| t.render(params))
        .collect::<Result<Vec<_>, _>>()?;
    wrap_commands_in_shell(platform, &rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse() {
        assert_eq!("linux".parse::<Platform>().unwrap(), Platform::Linux);
        assert_eq!("LINUX".parse::<Platform>().unwrap(), Platform::Linux);
        assert_eq!("posix".parse::<Platform>().unwrap(), Platform::Linux);
        assert_eq!("Windows".parse::<Platform>().unwrap(), Platform::Windows);
        assert_eq!(
            "plan9".parse::<Platform>(),
            Err(CommandError::UnsupportedPlatform("plan9".to_string()))
        );
    }

    #[test]
    fn test_render_substitutes_all_placeholders() {
        let template = CommandTemplate::new(
            "python $AZ_BATCH_NODE_SHARED_DIR/{task_file} --filepath {file_path} --idx {idx}",
        );
        let params = TaskParams::new()
            .set("task_file", "states_task.py")
            .set("file_path", "postal_codes_ct.csv")
            .set("idx", 3);

        assert_eq!(
            template.render(&params).unwrap(),
            "python $AZ_BATCH_NODE_SHARED_DIR/states_task.py --filepath postal_codes_ct.csv --idx 3"
        );
    }

    #[test]
    fn test_render_unknown_parameter() {
        let template = CommandTemplate::new("run {missing}");
        assert_eq!(
            template.render(&TaskParams::new()),
            Err(CommandError::UnknownParameter("missing".to_string()))
        );
    }

    #[test]
    fn test_render_escaped_braces() {
        let template = CommandTemplate::new("echo {{literal}} {name}");
        let params = TaskParams::new().set("name", "x");
        assert_eq!(template.render(&params).unwrap(), "echo {literal} x");
    }

    #[test]
    fn test_placeholders_in_order() {
        let template = CommandTemplate::new("{b} {a} {b} {{c}}");
        assert_eq!(template.placeholders(), vec!["b", "a"]);
    }

    #[test]
    fn test_wrap_linux() {
        let cmds = vec!["echo a".to_string(), "echo b".to_string()];
        assert_eq!(
            wrap_commands_in_shell(Platform::Linux, &cmds).unwrap(),
            "/bin/bash -c 'set -e; set -o pipefail; echo a;echo b; wait'"
        );
    }

    #[test]
    fn test_wrap_linux_escapes_single_quotes() {
        let cmds = vec!["echo 'hi'".to_string()];
        assert_eq!(
            wrap_commands_in_shell(Platform::Linux, &cmds).unwrap(),
            r"/bin/bash -c 'set -e; set -o pipefail; echo '\''hi'\''; wait'"
        );
    }

    #[test]
    fn test_wrap_windows() {
        let cmds = vec!["echo a".to_string(), "echo b".to_string()];
        assert_eq!(
            wrap_commands_in_shell(Platform::Windows, &cmds).unwrap(),
            "cmd.exe /c \"echo a&echo b\""
        );
    }

    #[test]
    fn test_wrap_empty() {
        assert_eq!(wrap_commands_in_shell(Platform::Linux, &[]), Err(CommandError::Empty));
    }

    #[test]
    fn test_build_command_unsupported_platform_skips_rendering() {
        // The template would fail to render; the platform error must win.
        let template = CommandTemplate::new("{never_set}");
        assert_eq!(
            build_command("plan9", &template, &TaskParams::new()),
            Err(CommandError::UnsupportedPlatform("plan9".to_string()))
        );
    }

    #[test]
    fn test_build_command_sequence() {
        let templates = vec![
            CommandTemplate::new("cp -p {task_file} $AZ_BATCH_NODE_SHARED_DIR"),
            CommandTemplate::new("chmod +x $AZ_BATCH_NODE_SHARED_DIR/{task_file}"),
        ];
        let params = TaskParams::new().set("task_file", "run.sh");
        let line = build_command_sequence(Platform::Linux, &templates, &params).unwrap();
        assert!(line.contains("cp -p run.sh $AZ_BATCH_NODE_SHARED_DIR;chmod +x"));
    }
}
