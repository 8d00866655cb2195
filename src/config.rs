use ::config::{Config, ConfigError as SourceError, Environment, File, FileFormat};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Pause after this many messages unless the campaign says otherwise.
pub const DEFAULT_COOLDOWN: u32 = 30;
/// Seconds the operator gets to abort unless the campaign says otherwise.
pub const DEFAULT_COUNTDOWN: u64 = 30;
/// Campaigns may not shorten the abort window below this.
pub const MIN_COUNTDOWN: u64 = 10;

const ENV_PREFIX: &str = "XMAILGUN";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{what} file '{path}' could not be read: {source}")]
    Load {
        what: &'static str,
        path: String,
        source: SourceError,
    },
    #[error("recipient file '{path}' could not be read: {source}")]
    RecipientsRead {
        path: String,
        source: std::io::Error,
    },
    #[error("recipient file '{path}' is not a valid recipient list: {source}")]
    RecipientsParse {
        path: String,
        source: serde_json::Error,
    },
    #[error("required fields for {0}")]
    MissingFields(&'static str),
    #[error("unknown connection type '{0}' (expected ssl, tls, starttls or plain)")]
    UnknownSecurity(String),
    #[error("no connection type given and port {0} does not imply one")]
    NoSecurity(u16),
    #[error("safety countdown < {min} s not supported (got {got} s)")]
    CountdownTooShort { min: u64, got: u64 },
    #[error("{what} '{path}' must exist and be a non-empty file")]
    MissingFile { what: &'static str, path: String },
    #[error("required fields for attachment: path and type")]
    Attachment,
    #[error("required field for recipient #{0}: email")]
    RecipientEmail(usize),
}

/// How the SMTP channel gets encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Implicit TLS from the first byte (`ssl`/`tls`, usually port 465).
    Tls,
    /// Plain TCP upgraded in-session.
    StartTls,
    /// No encryption at all. Only sensible for a local relay.
    Plain,
}

impl SecurityMode {
    /// Explicit `type` wins. Without one, port 465 is the only port that
    /// implies a mode.
    pub fn resolve(kind: Option<&str>, port: u16) -> Result<Self, ConfigError> {
        match kind.map(str::trim).filter(|k| !k.is_empty()) {
            Some(k) => match k.to_ascii_lowercase().as_str() {
                "ssl" | "tls" => Ok(SecurityMode::Tls),
                "starttls" => Ok(SecurityMode::StartTls),
                "plain" | "none" => Ok(SecurityMode::Plain),
                _ => Err(ConfigError::UnknownSecurity(k.to_string())),
            },
            None if port == 465 => Ok(SecurityMode::Tls),
            None => Err(ConfigError::NoSecurity(port)),
        }
    }
}

// Structure for SMTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    // Use `secrecy::Secret` for the password to prevent accidental logging
    pub password: SecretString,
    #[serde(rename = "type", default)]
    pub security: Option<String>,
    /// Per-command SMTP timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_timeout() -> u64 {
    30
}

impl SmtpConfig {
    /// Loads the SMTP credentials.
    ///
    /// Reads configuration from:
    /// 1. the given file (JSON, or TOML when the extension says so)
    /// 2. environment variables prefixed with `XMAILGUN_` (e.g. `XMAILGUN_PASSWORD`)
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: SmtpConfig = Config::builder()
            .add_source(source_file(path))
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|source| ConfigError::Load {
                what: "config",
                path: path.display().to_string(),
                source,
            })?;

        config.validate()?;
        log::debug!(
            "Loaded SMTP config for \"{}@{}:{}\"",
            config.username,
            config.host,
            config.port
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty()
            || self.port == 0
            || self.username.is_empty()
            || self.get_password().is_empty()
        {
            return Err(ConfigError::MissingFields(
                "config: host, port, username, password",
            ));
        }
        self.security_mode().map(|_| ())
    }

    pub fn security_mode(&self) -> Result<SecurityMode, ConfigError> {
        SecurityMode::resolve(self.security.as_deref(), self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn get_password(&self) -> &str {
        self.password.expose_secret()
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Attachment {
    #[serde(default)]
    pub path: PathBuf,
    #[serde(rename = "type", default)]
    pub content_type: String,
    /// Empty means "use the charset of the mail".
    #[serde(default)]
    pub charset: String,
}

impl Attachment {
    /// Checks the required fields and rebases `path` onto the directory of
    /// the file that declared it.
    fn resolve(&mut self, declared_in: &Path) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() || self.content_type.is_empty() {
            return Err(ConfigError::Attachment);
        }
        self.path = relative_to(declared_in, &self.path);
        ensure_non_empty_file("attachment", &self.path)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

// Structure for a single recipient
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Recipient {
    #[serde(default)]
    pub realname: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

impl Recipient {
    /// Substitutions for this recipient: the declared variables in order,
    /// then `{{realname}}`, `{{email}}` and `{{url}}` when set.
    pub fn template_variables(&self) -> Vec<(&str, &str)> {
        let mut vars: Vec<(&str, &str)> = self
            .variables
            .iter()
            .map(|v| (v.name.as_str(), v.value.as_str()))
            .collect();

        for (name, value) in [
            ("{{realname}}", &self.realname),
            ("{{email}}", &self.email),
            ("{{url}}", &self.url),
        ] {
            if !value.is_empty() {
                vars.push((name, value.as_str()));
            }
        }
        vars
    }
}

/// Reads the recipient list (a JSON array) and resolves attachment paths
/// relative to the list itself.
pub fn load_recipients(path: &Path) -> Result<Vec<Recipient>, ConfigError> {
    let path_str = path.display().to_string();
    let data = fs::read(path).map_err(|source| ConfigError::RecipientsRead {
        path: path_str.clone(),
        source,
    })?;
    let mut recipients: Vec<Recipient> =
        serde_json::from_slice(&data).map_err(|source| ConfigError::RecipientsParse {
            path: path_str.clone(),
            source,
        })?;

    if recipients.is_empty() {
        log::warn!("zero recipients specified in \"{}\"", path_str);
    }

    for (i, recipient) in recipients.iter_mut().enumerate() {
        if recipient.email.trim().is_empty() {
            return Err(ConfigError::RecipientEmail(i + 1));
        }
        for attachment in &mut recipient.attachments {
            attachment.resolve(path)?;
        }
    }

    log::debug!(
        "Loaded {} recipients from \"{}\"",
        recipients.len(),
        path_str
    );
    Ok(recipients)
}

/// One mailing run: everything shared by the messages of a batch.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Campaign {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub sender: String,
    #[serde(rename = "replyto", default)]
    pub reply_to: String,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(rename = "bodytemplate", default)]
    pub body_template: PathBuf,
    #[serde(default)]
    pub charset: String,
    #[serde(rename = "recipientfile", default)]
    pub recipient_file: PathBuf,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Messages per pause, and minutes per pause.
    #[serde(default)]
    pub cooldown: Option<u32>,
    #[serde(rename = "safetycountdown", default)]
    pub countdown: Option<u64>,
}

impl Campaign {
    /// Loads a campaign (task) file, validates it and rebases every path
    /// onto the directory of that file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut campaign: Campaign = Config::builder()
            .add_source(source_file(path))
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|source| ConfigError::Load {
                what: "task",
                path: path.display().to_string(),
                source,
            })?;

        campaign.validate()?;
        campaign.resolve_paths(path)?;

        log::debug!(
            "Loaded task \"{}\" from \"{}\"",
            campaign.name,
            path.display()
        );
        Ok(campaign)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty()
            || self.sender.is_empty()
            || self.subject.is_empty()
            || self.recipient_file.as_os_str().is_empty()
            || self.body_template.as_os_str().is_empty()
        {
            return Err(ConfigError::MissingFields(
                "task: name, sender, subject, recipientfile, bodytemplate",
            ));
        }
        match self.countdown {
            Some(got) if got != 0 && got < MIN_COUNTDOWN => Err(ConfigError::CountdownTooShort {
                min: MIN_COUNTDOWN,
                got,
            }),
            _ => Ok(()),
        }
    }

    fn resolve_paths(&mut self, declared_in: &Path) -> Result<(), ConfigError> {
        self.recipient_file = relative_to(declared_in, &self.recipient_file);
        self.body_template = relative_to(declared_in, &self.body_template);
        ensure_non_empty_file("recipient file", &self.recipient_file)?;
        ensure_non_empty_file("body template", &self.body_template)?;
        for attachment in &mut self.attachments {
            attachment.resolve(declared_in)?;
        }
        Ok(())
    }

    /// Cooldown and countdown for this run. Campaign overrides are dropped,
    /// with a warning, in dry-run mode.
    pub fn pacing(&self, dry_run: bool) -> Pacing {
        let mut pacing = Pacing::default();

        if let Some(cooldown) = self.cooldown.filter(|c| *c != 0) {
            if dry_run {
                log::warn!("task-specific cooldown not active when --dryrun is specified");
            } else {
                pacing.cooldown = cooldown;
            }
        }
        if let Some(countdown) = self.countdown.filter(|c| *c != 0) {
            if dry_run {
                log::warn!("task-specific safety countdown not active when --dryrun is specified");
            } else {
                pacing.countdown = countdown;
            }
        }
        pacing
    }
}

/// Throttling parameters of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub cooldown: u32,
    pub countdown: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Pacing {
            cooldown: DEFAULT_COOLDOWN,
            countdown: DEFAULT_COUNTDOWN,
        }
    }
}

fn source_file(path: &Path) -> File<::config::FileSourceFile, FileFormat> {
    let format = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Json,
    };
    File::new(&path.to_string_lossy(), format)
}

fn relative_to(reference_file: &Path, target: &Path) -> PathBuf {
    match reference_file.parent() {
        Some(dir) => dir.join(target),
        None => target.to_path_buf(),
    }
}

fn ensure_non_empty_file(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        _ => Err(ConfigError::MissingFile {
            what,
            path: path.display().to_string(),
        }),
    }
}
