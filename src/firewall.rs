//! Inbound firewall rule management
//!
//! Opening the proxy port needs administrative privilege the proxy cannot
//! assume, so every operation reports failure as a value and callers carry
//! on without the rule. Rules are identified by name only; the OS tool is
//! the source of truth for whether one exists.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("firewall tool not found: {0}")]
    ToolNotFound(String),

    #[error("not permitted to run {0}")]
    PermissionDenied(String),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {output}")]
    CommandFailed {
        program: String,
        status: String,
        output: String,
    },

    #[error("no firewall rule named '{0}'")]
    RuleNotFound(String),

    #[error("firewall management is not supported on this platform")]
    Unsupported,
}

pub type FirewallResult<T> = Result<T, FirewallError>;

/// Adds and removes the inbound allow-rule for the proxy port
#[async_trait]
pub trait FirewallController: Send + Sync {
    /// Allow inbound TCP on `port` under `rule_name`. Re-adding is harmless.
    async fn add_rule(&self, port: u16, rule_name: &str) -> FirewallResult<()>;

    /// Delete every rule named `rule_name`
    async fn remove_rule(&self, rule_name: &str) -> FirewallResult<()>;

    /// Whether the process holds administrative privilege
    fn is_elevated(&self) -> bool;
}

/// Which OS tool a [`SystemFirewall`] drives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallBackend {
    /// `netsh advfirewall` on Windows
    Netsh { program: PathBuf },
    /// `iptables` with the rule name stored in a comment match
    Iptables { program: PathBuf, chain: String },
    Unsupported,
}

impl FirewallBackend {
    /// The backend for the platform this binary was built for
    pub fn detect() -> Self {
        if cfg!(windows) {
            Self::Netsh {
                program: PathBuf::from("netsh"),
            }
        } else if cfg!(target_os = "linux") {
            Self::Iptables {
                program: PathBuf::from("iptables"),
                chain: "INPUT".to_string(),
            }
        } else {
            Self::Unsupported
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Netsh { .. } => "netsh",
            Self::Iptables { .. } => "iptables",
            Self::Unsupported => "unsupported",
        }
    }
}

/// Firewall controller that shells out to the OS firewall tool
pub struct SystemFirewall {
    backend: FirewallBackend,
}

impl SystemFirewall {
    pub fn new() -> Self {
        Self::with_backend(FirewallBackend::detect())
    }

    pub fn with_backend(backend: FirewallBackend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &FirewallBackend {
        &self.backend
    }
}

impl Default for SystemFirewall {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FirewallController for SystemFirewall {
    async fn add_rule(&self, port: u16, rule_name: &str) -> FirewallResult<()> {
        match &self.backend {
            FirewallBackend::Netsh { program } => {
                let output = run(program, &netsh_add_args(port, rule_name)).await?;
                expect_success(program, &output)
            }
            FirewallBackend::Iptables { program, chain } => {
                let check = run(program, &iptables_rule_args("-C", chain, port, rule_name)).await?;
                if check.status.success() {
                    debug!("Firewall rule '{}' already present", rule_name);
                    return Ok(());
                }

                let output = run(program, &iptables_rule_args("-I", chain, port, rule_name)).await?;
                expect_success(program, &output)
            }
            FirewallBackend::Unsupported => Err(FirewallError::Unsupported),
        }
    }

    async fn remove_rule(&self, rule_name: &str) -> FirewallResult<()> {
        match &self.backend {
            FirewallBackend::Netsh { program } => {
                let output = run(program, &netsh_delete_args(rule_name)).await?;
                expect_success(program, &output)
            }
            FirewallBackend::Iptables { program, chain } => {
                let list_args = ["-w".to_string(), "-S".to_string(), chain.clone()];
                let listing = run(program, &list_args).await?;
                expect_success(program, &listing)?;

                let rules = matching_rules(&String::from_utf8_lossy(&listing.stdout), rule_name);
                if rules.is_empty() {
                    return Err(FirewallError::RuleNotFound(rule_name.to_string()));
                }

                for mut rule in rules {
                    rule[0] = "-D".to_string();
                    rule.insert(0, "-w".to_string());
                    let output = run(program, &rule).await?;
                    expect_success(program, &output)?;
                }
                Ok(())
            }
            FirewallBackend::Unsupported => Err(FirewallError::Unsupported),
        }
    }

    fn is_elevated(&self) -> bool {
        is_elevated()
    }
}

/// Controller that never touches the OS firewall
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledFirewall;

#[async_trait]
impl FirewallController for DisabledFirewall {
    async fn add_rule(&self, port: u16, rule_name: &str) -> FirewallResult<()> {
        debug!(
            "Firewall management disabled, not adding '{}' for port {}",
            rule_name, port
        );
        Ok(())
    }

    async fn remove_rule(&self, rule_name: &str) -> FirewallResult<()> {
        debug!("Firewall management disabled, not removing '{}'", rule_name);
        Ok(())
    }

    fn is_elevated(&self) -> bool {
        is_elevated()
    }
}

/// Whether the current process runs with administrative privilege
#[cfg(unix)]
pub fn is_elevated() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Whether the current process runs with administrative privilege
#[cfg(windows)]
pub fn is_elevated() -> bool {
    use std::os::windows::process::CommandExt;

    // `net session` only succeeds for members of the Administrators group
    std::process::Command::new("net")
        .arg("session")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW)
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
pub fn is_elevated() -> bool {
    false
}

fn netsh_add_args(port: u16, rule_name: &str) -> Vec<String> {
    vec![
        "advfirewall".to_string(),
        "firewall".to_string(),
        "add".to_string(),
        "rule".to_string(),
        format!("name={}", rule_name),
        "dir=in".to_string(),
        "action=allow".to_string(),
        "protocol=tcp".to_string(),
        format!("localport={}", port),
    ]
}

fn netsh_delete_args(rule_name: &str) -> Vec<String> {
    vec![
        "advfirewall".to_string(),
        "firewall".to_string(),
        "delete".to_string(),
        "rule".to_string(),
        format!("name={}", rule_name),
    ]
}

fn iptables_rule_args(action: &str, chain: &str, port: u16, rule_name: &str) -> Vec<String> {
    [
        "-w",
        action,
        chain,
        "-p",
        "tcp",
        "--dport",
        &port.to_string(),
        "-m",
        "comment",
        "--comment",
        rule_name,
        "-j",
        "ACCEPT",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

/// Rules from `iptables -S` output whose comment equals `rule_name`
fn matching_rules(listing: &str, rule_name: &str) -> Vec<Vec<String>> {
    listing
        .lines()
        .map(split_rule_line)
        .filter(|tokens| {
            tokens.first().map(String::as_str) == Some("-A")
                && tokens
                    .windows(2)
                    .any(|pair| pair[0] == "--comment" && pair[1] == rule_name)
        })
        .collect()
}

/// Split an `iptables -S` line into arguments, honouring double quotes
fn split_rule_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

async fn run(program: &Path, args: &[String]) -> FirewallResult<Output> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(windows)]
    command.creation_flags(CREATE_NO_WINDOW);

    debug!("Running {} {}", program.display(), args.join(" "));

    let program_name = program.display().to_string();
    command.output().await.map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => FirewallError::ToolNotFound(program_name),
        io::ErrorKind::PermissionDenied => FirewallError::PermissionDenied(program_name),
        _ => FirewallError::Spawn {
            program: program_name,
            source,
        },
    })
}

fn expect_success(program: &Path, output: &Output) -> FirewallResult<()> {
    if output.status.success() {
        return Ok(());
    }

    // netsh reports its errors on stdout
    let stderr = String::from_utf8_lossy(&output.stderr);
    let text = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout)
    } else {
        stderr
    };

    Err(FirewallError::CommandFailed {
        program: program.display().to_string(),
        status: output.status.to_string(),
        output: text.trim().to_string(),
    })
}
