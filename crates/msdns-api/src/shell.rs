use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Result of one remote script run.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a PowerShell script on the DNS server.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run(&self, script: &str) -> std::io::Result<ShellOutput>;
}

/// OpenSSH into a Windows host whose default shell can start `powershell`.
///
/// Runs non-interactively (`BatchMode=yes`), so key-based auth must already
/// be in place. The script is fed on stdin to avoid quoting it for the
/// remote command line.
#[derive(Debug, Clone)]
pub struct SshShell {
    target: String,
    port: Option<u16>,
    identity: Option<String>,
}

impl SshShell {
    /// `target` is `host` or `user@host`.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            port: None,
            identity: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn identity(mut self, path: impl Into<String>) -> Self {
        self.identity = Some(path.into());
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=15"]);
        if let Some(port) = self.port {
            cmd.arg("-p").arg(port.to_string());
        }
        if let Some(identity) = &self.identity {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(&self.target)
            .args(["powershell", "-NoProfile", "-NonInteractive", "-Command", "-"]);
        cmd
    }
}

/// Turn cmdlet errors into a non-zero exit with the message on stderr.
fn wrap(script: &str) -> String {
    format!(
        "$ErrorActionPreference = 'Stop'\r\n\
         try {{ {script} }} catch {{ [Console]::Error.WriteLine($_.Exception.Message); exit 1 }}\r\n\
         exit 0\r\n"
    )
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(&self, script: &str) -> std::io::Result<ShellOutput> {
        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(wrap(script).as_bytes()).await?;
        }

        let out = child.wait_with_output().await?;
        Ok(ShellOutput {
            status: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_exits_non_zero_on_cmdlet_error() {
        let wrapped = wrap("Get-DnsServerZone");
        assert!(wrapped.starts_with("$ErrorActionPreference = 'Stop'"));
        assert!(wrapped.contains("try { Get-DnsServerZone } catch {"));
        assert!(wrapped.contains("exit 1"));
    }
}
