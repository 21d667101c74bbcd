use std::ffi::OsString;
use std::path::Path;

use anyhow::Result;

use crate::error_codes::CaptureError;

pub const DEFAULT_ENCODER_BINARY: &str = "ffmpeg";
pub const INPUT_KEY: &str = "-i";
pub const OUTPUT_KEY: &str = "output";
pub const PROTOCOL_WHITELIST: &str = "concat,ffconcat,file,subfile,data,crypto,tcp,tls";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgToken {
    Literal(String),
    /// Replaced by the generated concat script path.
    ScriptPath,
    /// Replaced by the requested output path.
    OutputPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderArg {
    pub key: String,
    pub tokens: Vec<ArgToken>,
    pub enabled: bool,
}

impl EncoderArg {
    fn new(key: &str, tokens: Vec<ArgToken>) -> Self {
        Self {
            key: key.to_owned(),
            tokens,
            enabled: true,
        }
    }

    fn flag(key: &str, value: Option<&str>) -> Self {
        let mut tokens = vec![ArgToken::Literal(key.to_owned())];
        if let Some(value) = value {
            tokens.push(ArgToken::Literal(value.to_owned()));
        }
        Self::new(key, tokens)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgOverride {
    /// Replace the argument's tokens, or add it if the key is new.
    Set(Vec<String>),
    /// Leave the argument out of the command line entirely.
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedOverride {
    pub key: String,
    pub action: ArgOverride,
}

impl KeyedOverride {
    pub fn set(key: &str, value: &str) -> Self {
        let tokens = if key.starts_with('-') {
            let mut tokens = vec![key.to_owned()];
            if !value.is_empty() {
                tokens.push(value.to_owned());
            }
            tokens
        } else {
            vec![value.to_owned()]
        };
        Self {
            key: key.to_owned(),
            action: ArgOverride::Set(tokens),
        }
    }

    pub fn remove(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            action: ArgOverride::Remove,
        }
    }

    /// Parses `KEY=VALUE`. Flag keys (leading `-`) keep the flag in front of
    /// the value, so `-qp=20` becomes `-qp 20`; an empty value leaves a bare
    /// flag. Other keys, like `output`, take the value alone.
    pub fn parse(raw: &str) -> Result<Self> {
        let (key, value) = raw.split_once('=').ok_or_else(|| {
            CaptureError::argument(
                "E_ARG_OVERRIDE",
                format!("invalid encoder argument override '{raw}': expected KEY=VALUE"),
            )
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(CaptureError::argument(
                "E_ARG_OVERRIDE",
                format!("invalid encoder argument override '{raw}': empty key"),
            )
            .into());
        }
        Ok(Self::set(key, value))
    }
}

/// Ordered encoder command line, keyed so callers can replace or drop
/// individual arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderArgs {
    args: Vec<EncoderArg>,
}

impl Default for EncoderArgs {
    fn default() -> Self {
        Self::defaults()
    }
}

impl EncoderArgs {
    pub fn defaults() -> Self {
        Self {
            args: vec![
                EncoderArg::flag("-y", None),
                EncoderArg::flag("-f", Some("concat")),
                EncoderArg::flag("-safe", Some("0")),
                EncoderArg::flag("-protocol_whitelist", Some(PROTOCOL_WHITELIST)),
                EncoderArg::new(
                    INPUT_KEY,
                    vec![ArgToken::Literal(INPUT_KEY.to_owned()), ArgToken::ScriptPath],
                ),
                EncoderArg::flag("-fps_mode", Some("vfr")),
                EncoderArg::flag("-qp", Some("8")),
                EncoderArg::new(OUTPUT_KEY, vec![ArgToken::OutputPath]),
            ],
        }
    }

    pub fn get(&self, key: &str) -> Option<&EncoderArg> {
        self.args.iter().find(|arg| arg.enabled && arg.key == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.args
            .iter()
            .filter(|arg| arg.enabled)
            .map(|arg| arg.key.as_str())
    }

    pub fn apply(&mut self, key: &str, action: &ArgOverride) {
        match action {
            ArgOverride::Remove => {
                if let Some(arg) = self.args.iter_mut().find(|arg| arg.key == key) {
                    arg.enabled = false;
                }
            }
            ArgOverride::Set(values) => {
                let tokens = values.iter().cloned().map(ArgToken::Literal).collect();
                if let Some(arg) = self.args.iter_mut().find(|arg| arg.key == key) {
                    arg.tokens = tokens;
                    arg.enabled = true;
                    return;
                }
                // Output options must come before the output file.
                let position = self
                    .args
                    .iter()
                    .position(|arg| arg.key == OUTPUT_KEY)
                    .unwrap_or(self.args.len());
                self.args.insert(position, EncoderArg::new(key, tokens));
            }
        }
    }

    pub fn apply_all(&mut self, overrides: &[KeyedOverride]) {
        for keyed in overrides {
            self.apply(&keyed.key, &keyed.action);
        }
    }

    /// Flattens the enabled arguments into an argv, filling the script and
    /// output slots that were not customized.
    pub fn resolve(&self, script_path: &Path, output_path: &Path) -> Vec<OsString> {
        self.args
            .iter()
            .filter(|arg| arg.enabled)
            .flat_map(|arg| arg.tokens.iter())
            .map(|token| match token {
                ArgToken::Literal(value) => OsString::from(value),
                ArgToken::ScriptPath => script_path.as_os_str().to_owned(),
                ArgToken::OutputPath => output_path.as_os_str().to_owned(),
            })
            .collect()
    }
}

pub fn display_command(binary: &str, args: &[OsString]) -> String {
    std::iter::once(binary.to_owned())
        .chain(args.iter().map(|arg| arg.to_string_lossy().into_owned()))
        .collect::<Vec<_>>()
        .join(" ")
}
