//! SSH transport implementation
//!
//! Blocking SSH-2 sessions via the ssh2 crate (libssh2 bindings).
//! Authentication tries, in order: password (when configured), the SSH
//! agent, then the user's default private keys.

use super::{
    tail_from_offset_command, CommandOutput, ConnectionError, Connector, RemoteError, RemoteShell,
};
use crate::config::TestConfiguration;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

// libssh2 error codes we classify
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

fn session_code(err: &ssh2::Error) -> Option<i32> {
    match err.code() {
        ssh2::ErrorCode::Session(code) => Some(code),
        ssh2::ErrorCode::SFTP(_) => None,
    }
}

fn is_timeout(err: &ssh2::Error) -> bool {
    matches!(
        session_code(err),
        Some(LIBSSH2_ERROR_TIMEOUT | LIBSSH2_ERROR_SOCKET_TIMEOUT)
    )
}

fn is_session_lost(err: &ssh2::Error) -> bool {
    matches!(
        session_code(err),
        Some(
            LIBSSH2_ERROR_SOCKET_SEND
                | LIBSSH2_ERROR_SOCKET_DISCONNECT
                | LIBSSH2_ERROR_SOCKET_RECV
        )
    )
}

/// Opens [`SshConnection`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

impl Connector for SshConnector {
    fn open(
        &self,
        config: &TestConfiguration,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteShell>, ConnectionError> {
        let connection = SshConnection::open(config, timeout)?;
        Ok(Box::new(connection))
    }
}

/// An authenticated SSH session to the relay
pub struct SshConnection {
    session: Option<ssh2::Session>,
    target: String,
}

impl SshConnection {
    /// Connect, handshake and authenticate
    pub fn open(config: &TestConfiguration, timeout: Duration) -> Result<Self, ConnectionError> {
        config.validate()?;

        let tcp = connect_tcp(&config.host, config.session_port, timeout)?;

        let mut session = ssh2::Session::new()
            .map_err(|e| ConnectionError::Network(format!("SSH session init failed: {}", e)))?;
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| {
            if is_timeout(&e) {
                ConnectionError::Timeout(timeout)
            } else {
                ConnectionError::Network(format!("SSH handshake failed: {}", e))
            }
        })?;

        authenticate(&session, config, timeout)?;
        debug!(relay = %config.target(), "SSH session authenticated");

        Ok(Self {
            session: Some(session),
            target: config.target(),
        })
    }

    fn session(&self) -> Result<&ssh2::Session, RemoteError> {
        self.session.as_ref().ok_or(RemoteError::Disconnected)
    }

    fn map_err(&self, command: &str, err: &ssh2::Error) -> RemoteError {
        if is_session_lost(err) {
            warn!(relay = %self.target, error = %err, "SSH session lost");
            RemoteError::Disconnected
        } else {
            RemoteError::command(command, err)
        }
    }

    /// Run `command`, returning raw stdout, raw stderr and exit status
    fn exec_raw(&mut self, command: &str) -> Result<(Vec<u8>, Vec<u8>, i32), RemoteError> {
        let session = self.session()?;

        let mut channel = session
            .channel_session()
            .map_err(|e| self.map_err(command, &e))?;
        channel.exec(command).map_err(|e| self.map_err(command, &e))?;

        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout)?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr)?;

        channel.wait_close().map_err(|e| self.map_err(command, &e))?;
        let status = channel.exit_status().map_err(|e| self.map_err(command, &e))?;

        Ok((stdout, stderr, status))
    }
}

impl RemoteShell for SshConnection {
    fn execute(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        let (stdout, stderr, exit_status) = self.exec_raw(command)?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    fn upload(&mut self, path: &str, content: &str) -> Result<(), RemoteError> {
        let command = format!("cat > {}", super::shell_quote(path));
        let session = self.session()?;

        let mut channel = session
            .channel_session()
            .map_err(|e| self.map_err(&command, &e))?;
        channel.exec(&command).map_err(|e| self.map_err(&command, &e))?;

        channel.write_all(content.as_bytes())?;
        channel.flush()?;
        // Close our writing half before waiting on the result
        channel.send_eof().map_err(|e| self.map_err(&command, &e))?;
        channel.wait_eof().map_err(|e| self.map_err(&command, &e))?;
        channel.wait_close().map_err(|e| self.map_err(&command, &e))?;

        let status = channel.exit_status().map_err(|e| self.map_err(&command, &e))?;
        if status != 0 {
            return Err(RemoteError::command(&command, format!("exit status {}", status)));
        }
        Ok(())
    }

    fn fetch_new_data(&mut self, path: &str, offset: u64) -> Result<Vec<u8>, RemoteError> {
        let command = tail_from_offset_command(path, offset);
        let (stdout, stderr, status) = self.exec_raw(&command)?;
        if status != 0 {
            return Err(RemoteError::command(
                &command,
                String::from_utf8_lossy(&stderr).trim().to_string(),
            ));
        }
        Ok(stdout)
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "Cable test finished", None);
            debug!(relay = %self.target, "SSH session closed");
        }
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ConnectionError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| ConnectionError::Network(format!("Cannot resolve {}: {}", host, e)))?
        .collect();

    if addrs.is_empty() {
        return Err(ConnectionError::Network(format!("No address for {}", host)));
    }

    let mut last_err = None;
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "TCP connect attempt failed");
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) =>
        {
            Err(ConnectionError::Timeout(timeout))
        }
        Some(e) => Err(ConnectionError::Network(format!("{}:{}: {}", host, port, e))),
        None => Err(ConnectionError::Network(format!("{}:{}: unreachable", host, port))),
    }
}

fn authenticate(
    session: &ssh2::Session,
    config: &TestConfiguration,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    let user = config.username.as_str();

    let auth_err = |what: &str, e: ssh2::Error| {
        if is_timeout(&e) {
            ConnectionError::Timeout(timeout)
        } else if matches!(
            session_code(&e),
            Some(LIBSSH2_ERROR_AUTHENTICATION_FAILED | LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED)
        ) {
            ConnectionError::Authentication(format!("{} rejected for {}", what, user))
        } else if is_session_lost(&e) {
            ConnectionError::Network(format!("{} auth: {}", what, e))
        } else {
            ConnectionError::Authentication(format!("{} auth failed: {}", what, e))
        }
    };

    if let Some(password) = &config.credential {
        session
            .userauth_password(user, password)
            .map_err(|e| auth_err("Password", e))?;
    } else {
        if let Err(e) = try_agent(session, user) {
            debug!(error = %e, "SSH agent authentication unavailable");
        }

        if !session.authenticated() {
            for key in default_key_files() {
                if session.userauth_pubkey_file(user, None, &key, None).is_ok() {
                    debug!(key = %key.display(), "Authenticated with key file");
                    break;
                }
            }
        }
    }

    if !session.authenticated() {
        return Err(ConnectionError::Authentication(format!(
            "No accepted credential for {}",
            user
        )));
    }
    Ok(())
}

fn try_agent(session: &ssh2::Session, user: &str) -> Result<(), ssh2::Error> {
    let mut agent = session.agent()?;
    agent.connect()?;
    agent.list_identities()?;

    for identity in agent.identities()? {
        if agent.userauth(user, &identity).is_ok() {
            break;
        }
    }
    let _ = agent.disconnect();
    Ok(())
}

fn default_key_files() -> Vec<PathBuf> {
    let Some(dirs) = directories::BaseDirs::new() else {
        return Vec::new();
    };
    let ssh_dir = dirs.home_dir().join(".ssh");
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .filter(|path| path.exists())
        .collect()
}
