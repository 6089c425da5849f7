//! Thin capability facade over the SSH protocol library.
//!
//! The library itself (key exchange, crypto, channel multiplexing) is an
//! external collaborator behind the [`SshEngine`] trait; everything here
//! wraps it with a stable, safe surface: session options, the
//! authentication entry points, a keyboard-interactive sub-session, and a
//! channel that can run one remote command. All of the engine's socket
//! traffic goes through the POSIX facade.
//!
//! [`Key`] is concrete: it carries the raw wire blob of a public key, which
//! is what fingerprints (known-hosts MD5, SSHFP SHA-1) are computed over.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest as _, Md5};
use sha1::Sha1;

/// Connection timeout applied to every session.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Host key types offered during key exchange.
// TODO: restore ssh-ed25519 once the SSH library verifies those host keys;
// until then a server preferring ed25519 would fail verification.
pub const HOST_KEY_ALGORITHMS: &str =
    "ecdsa-sha2-nistp256,ecdsa-sha2-nistp384,ecdsa-sha2-nistp521,ssh-rsa,ssh-dss";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Unknown,
    Dss,
    Rsa,
    Ecdsa,
    Ed25519,
}

impl KeyType {
    pub fn name(self) -> &'static str {
        match self {
            KeyType::Unknown => "unknown",
            KeyType::Dss => "ssh-dss",
            KeyType::Rsa => "ssh-rsa",
            KeyType::Ecdsa => "ecdsa",
            KeyType::Ed25519 => "ssh-ed25519",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A public key as the raw SSH wire blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    key_type: KeyType,
    blob: Vec<u8>,
}

impl Key {
    /// Imports a base64 public key blob (the second field of an OpenSSH
    /// `authorized_keys` line). The key type is read from the blob itself.
    pub fn from_public_base64(material: &str) -> Result<Key> {
        let blob = BASE64
            .decode(material.trim().as_bytes())
            .map_err(|_| Error::BadKey)?;
        let key_type = blob_key_type(&blob).ok_or(Error::BadKey)?;
        Ok(Key { key_type, blob })
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// MD5 fingerprint as colon-separated hex, the known-hosts format.
    pub fn md5(&self) -> String {
        let digest = Md5::digest(&self.blob);
        let mut out = String::with_capacity(digest.len() * 3);
        for (i, b) in digest.iter().enumerate() {
            if i > 0 {
                out.push(':');
            }
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    /// Raw SHA-1 digest of the blob, the form SSHFP records carry.
    pub fn sha1_digest(&self) -> Vec<u8> {
        Sha1::digest(&self.blob).to_vec()
    }
}

/// Reads the key type string leading the wire blob.
fn blob_key_type(blob: &[u8]) -> Option<KeyType> {
    if blob.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes(blob[..4].try_into().unwrap()) as usize;
    let name = blob.get(4..4 + len)?;
    match name {
        b"ssh-rsa" => Some(KeyType::Rsa),
        b"ssh-dss" => Some(KeyType::Dss),
        b"ecdsa-sha2-nistp256" | b"ecdsa-sha2-nistp384" | b"ecdsa-sha2-nistp521" => {
            Some(KeyType::Ecdsa)
        }
        b"ssh-ed25519" => Some(KeyType::Ed25519),
        _ => None,
    }
}

/// Authentication methods, in the SSH library's terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Password,
    PublicKey,
    HostBased,
    Interactive,
    None,
}

impl AuthType {
    pub fn name(self) -> &'static str {
        match self {
            AuthType::Password => "Password",
            AuthType::PublicKey => "Public Key",
            AuthType::HostBased => "Host Based",
            AuthType::Interactive => "Keyboard Interactive",
            AuthType::None => "None",
        }
    }
}

/// Outcome of one engine authentication step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    Success,
    /// Accepted, but the server requires a further method.
    Partial,
    Denied,
    /// Keyboard-interactive: the server sent prompts.
    Info,
    /// Protocol or transport error.
    Failed,
}

/// One keyboard-interactive prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    /// Whether the answer should be echoed back to the user. This facade
    /// never prints anything; echoing is the caller's job.
    pub echo: bool,
}

/// Session options set before connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOption {
    Host(String),
    Port(u16),
    User(String),
    ConnectTimeout(Duration),
    HostKeyAlgorithms(String),
}

/// The SSH protocol library, consumed as an opaque capability. A real
/// implementation drives its socket through the POSIX facade; tests script
/// it directly.
pub trait SshEngine: Send {
    fn set_option(&mut self, option: SessionOption) -> Result<()>;

    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self);

    /// Human-readable description of the last failure.
    fn last_error(&self) -> String;

    fn server_public_key(&mut self) -> Result<Key>;

    /// Attempts the "none" method.
    fn auth_none(&mut self) -> AuthStep;

    /// Methods advertised by the server after a failed "none".
    fn auth_methods(&mut self) -> Vec<AuthType>;

    fn auth_password(&mut self, password: &str) -> AuthStep;

    /// Loads private key material into the engine's key slot.
    fn import_private_key(&mut self, material: &str, passphrase: Option<&str>)
        -> Result<()>;

    /// Authenticates with the key last loaded by
    /// [`import_private_key`](Self::import_private_key).
    fn auth_loaded_key(&mut self) -> AuthStep;

    fn auth_agent(&mut self, user: &str) -> AuthStep;

    fn kbdint_step(&mut self) -> AuthStep;
    fn kbdint_name(&mut self) -> String;
    fn kbdint_instruction(&mut self) -> String;
    fn kbdint_prompts(&mut self) -> Vec<Prompt>;
    fn kbdint_answer(&mut self, index: usize, answer: &str) -> Result<()>;

    fn channel_open_session(&mut self) -> Result<()>;
    fn channel_request_pty(&mut self) -> Result<()>;
    fn channel_exec(&mut self, command: &str) -> Result<()>;
    /// Reads remote output; 0 means end of stream.
    fn channel_read(&mut self, buf: &mut [u8], stderr: bool) -> Result<usize>;
    fn channel_close(&mut self);
}

/// Result of a public key authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubkeyAuth {
    Success,
    Denied,
    /// The key material did not load: wrong passphrase, unsupported type,
    /// or corrupt input.
    BadKey,
}

/// An SSH session over an [`SshEngine`].
pub struct Session {
    engine: Box<dyn SshEngine>,
    user: String,
    connected: bool,
    server_key: Option<Key>,
}

impl Session {
    pub fn new(
        mut engine: Box<dyn SshEngine>,
        host: &str,
        port: u16,
        user: &str,
    ) -> Result<Session> {
        engine.set_option(SessionOption::Host(host.into()))?;
        engine.set_option(SessionOption::Port(port))?;
        engine.set_option(SessionOption::User(user.into()))?;
        engine.set_option(SessionOption::ConnectTimeout(CONNECT_TIMEOUT))?;
        engine.set_option(SessionOption::HostKeyAlgorithms(
            HOST_KEY_ALGORITHMS.into(),
        ))?;
        Ok(Session {
            engine,
            user: user.into(),
            connected: false,
            server_key: None,
        })
    }

    pub fn connect(&mut self) -> Result<()> {
        if self.connected {
            self.disconnect();
        }
        self.engine.connect()?;
        self.connected = true;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.server_key = None;
            self.engine.disconnect();
        }
    }

    pub fn last_error(&self) -> String {
        self.engine.last_error()
    }

    pub fn server_public_key(&mut self) -> Result<&Key> {
        if self.server_key.is_none() {
            self.server_key = Some(self.engine.server_public_key()?);
        }
        Ok(self.server_key.as_ref().unwrap())
    }

    /// The authentication types available, tried "none" first. A server
    /// that accepts "none" yields exactly `[AuthType::None]`: the session
    /// is already authenticated. An empty list means the query failed.
    pub fn auth_types(&mut self) -> Vec<AuthType> {
        match self.engine.auth_none() {
            AuthStep::Success => return vec![AuthType::None],
            AuthStep::Failed => return Vec::new(),
            _ => {}
        }
        self.engine.auth_methods()
    }

    pub fn auth_password(&mut self, password: &str) -> bool {
        matches!(self.engine.auth_password(password), AuthStep::Success)
    }

    pub fn auth_publickey(
        &mut self,
        material: &str,
        passphrase: Option<&str>,
    ) -> PubkeyAuth {
        if self.engine.import_private_key(material, passphrase).is_err() {
            return PubkeyAuth::BadKey;
        }
        match self.engine.auth_loaded_key() {
            AuthStep::Success => PubkeyAuth::Success,
            _ => PubkeyAuth::Denied,
        }
    }

    pub fn auth_agent(&mut self) -> bool {
        let user = self.user.clone();
        matches!(self.engine.auth_agent(&user), AuthStep::Success)
    }

    pub fn auth_interactive(&mut self) -> KeyboardInteractive<'_> {
        KeyboardInteractive {
            engine: self.engine.as_mut(),
            prompts: Vec::new(),
            current: 0,
        }
    }

    pub fn new_channel(&mut self) -> Channel<'_> {
        Channel { engine: self.engine.as_mut(), open: false }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Keyboard-interactive sub-session.
///
/// Call [`status`](Self::status) in a loop while it returns
/// [`KbdStatus::Pending`]; inside, alternate
/// [`next_prompt`](Self::next_prompt) and [`answer`](Self::answer) until
/// `answer` reports the set complete, then check `status` again.
pub struct KeyboardInteractive<'a> {
    engine: &'a mut dyn SshEngine,
    prompts: Vec<Prompt>,
    current: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KbdStatus {
    Authenticated,
    /// Accepted, but another method is still required.
    Partial,
    Pending,
    Failed,
}

impl KeyboardInteractive<'_> {
    pub fn status(&mut self) -> KbdStatus {
        loop {
            match self.engine.kbdint_step() {
                AuthStep::Success => return KbdStatus::Authenticated,
                AuthStep::Partial => return KbdStatus::Partial,
                AuthStep::Info => {
                    self.prompts = self.engine.kbdint_prompts();
                    self.current = 0;
                    if self.prompts.is_empty() {
                        // Servers may send empty question sets; keep going.
                        continue;
                    }
                    return KbdStatus::Pending;
                }
                AuthStep::Denied | AuthStep::Failed => return KbdStatus::Failed,
            }
        }
    }

    pub fn name(&mut self) -> String {
        self.engine.kbdint_name()
    }

    pub fn instruction(&mut self) -> String {
        self.engine.kbdint_instruction()
    }

    pub fn next_prompt(&self) -> Prompt {
        self.prompts.get(self.current).cloned().unwrap_or_default()
    }

    /// Answers the current prompt. Returns true once every prompt in the
    /// set has an answer; the caller then returns to
    /// [`status`](Self::status).
    pub fn answer(&mut self, answer: &str) -> bool {
        if self.engine.kbdint_answer(self.current, answer).is_err() {
            return false;
        }
        self.current += 1;
        self.current >= self.prompts.len()
    }
}

/// A channel running one remote command.
pub struct Channel<'a> {
    engine: &'a mut dyn SshEngine,
    open: bool,
}

impl Channel<'_> {
    /// Opens the session, requests a PTY and executes `command`.
    // TODO: make the PTY request optional.
    pub fn execute(&mut self, command: &str) -> Result<()> {
        if !self.open {
            self.engine.channel_open_session()?;
            self.open = true;
        }
        self.engine.channel_request_pty()?;
        self.engine.channel_exec(command)
    }

    /// Reads the whole remote stdout.
    pub fn read_stdout(&mut self) -> Result<String> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = self.engine.channel_read(&mut buf, false)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

impl Drop for Channel<'_> {
    fn drop(&mut self) {
        if self.open {
            self.engine.channel_close();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::moshlog::init_test_log;

    // Keys from the fingerprint test vectors.
    pub(crate) const RSA_PUB: &str = "AAAAB3NzaC1yc2EAAAADAQABAAABAQCgOJH7TgVaUtYMFkqJjjojUZYjq2spRihSx9U0MJ4pUMLnkV+MzuXWYN89TDkBrdw+xeYvL9KVs624sFJWa2KdGGC29uzZhHh6UC7sUy7CdXuuoNoukxnHjBuU74SkMLW4MagerN4eFq4l8F15anjzpmQ9/CjzqXKwMeITbxgzsGdDtyMswRX+KGk0leY+nmsw1E56RQoRgwIXJ6mLuep/WL3IBxoePJ+zZcremExWpxXjre3+F+aXRoRCASKHnd4nol7AlP4GiKJLPYWbVHJ5bzHo1WO5P2PVJvUQ13O8TMaYEmXs6RMq40RHKFEtMTRw39IInT7Ck63nmB3n5o8n";
    pub(crate) const DSA_PUB: &str = "AAAAB3NzaC1kc3MAAACBAPEkLhwjzIi4sr+K3CkXqwa1yk19l+ypCUv3qgWSvWi2iV07/luvN+0kTl/Y2Kx7EWty/JUstbzTHKfqTotDnr4nu1E31s8GKNwp8hLlRmt8g+V8lcrPDXUsMUQ/O9X3B7vTRHBLYJsfhgclhZaQRGZi4bDAYYfxWL8bDMCEzwOJAAAAFQDBbNrjQ5PaXupa2uCFUWVSbWz6YwAAAIEAhsgT8OeVOJ+G7Ph2Pj/Q329Yvnmbt0Sq8erPbxUzggJBB1kRLIc1tqBh+55VlUL2uwpMcr5rZdDxC54lPYU9XBqo2ep52MTuXudU76Uoyh9c4VeA6f7d8cJhASWEcRk6YX9prQIsBu8YbUe6TMexKJw7n25pMCL10O5tL7N7EaEAAACAEH0pD71hRBrXoCLqqa4UiBkDeImWgk5bKwufofaHnqQ2OU7wAuBV1XbO6uH/nxnfg/+CtvNpGCCDwsenCtIRZz+ajOjG33g4yD8uYjmZnCyTMNjwOyrH04FFfonWBT59a4TT0hYVhlNFtuwcdsN23vKauIoanYu32ON72ong1OI=";
    pub(crate) const ECDSA_PUB: &str = "AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBGOhrNT2LYCXEzuRIvtx1FVYktSZqtAysuAepDu/uEHPy0GJ0qklJ/Fd53E0t2LCb07KdjPYEov4HzYs0NhezPE=";

    #[test]
    fn key_types_read_from_blob() {
        init_test_log();
        assert_eq!(Key::from_public_base64(RSA_PUB).unwrap().key_type(), KeyType::Rsa);
        assert_eq!(Key::from_public_base64(DSA_PUB).unwrap().key_type(), KeyType::Dss);
        assert_eq!(
            Key::from_public_base64(ECDSA_PUB).unwrap().key_type(),
            KeyType::Ecdsa
        );
    }

    #[test]
    fn garbage_key_material_is_rejected() {
        init_test_log();
        assert!(Key::from_public_base64("!!!not base64!!!").is_err());
        // Valid base64, but no key blob inside.
        assert!(Key::from_public_base64("AAAA").is_err());
    }

    #[test]
    fn sha1_digest_matches_published_fingerprint() {
        init_test_log();
        let key = Key::from_public_base64(RSA_PUB).unwrap();
        let hex: String =
            key.sha1_digest().iter().map(|b| format!("{b:02X}")).collect();
        assert_eq!(hex, "1B9F53A938596DF02086CC972850D50B7C65F645");
    }

    #[test]
    fn md5_is_colon_separated() {
        init_test_log();
        let key = Key::from_public_base64(RSA_PUB).unwrap();
        let md5 = key.md5();
        assert_eq!(md5.len(), 16 * 2 + 15);
        assert_eq!(md5.matches(':').count(), 15);
    }

    /// Minimal engine scripted per test.
    #[derive(Default)]
    pub(crate) struct ScriptedEngine {
        pub none_accepted: bool,
        pub methods: Vec<AuthType>,
        pub password: Option<String>,
        pub fail_none: bool,
        pub channel_stdout: String,
        pub(crate) read_pos: usize,
    }

    impl SshEngine for ScriptedEngine {
        fn set_option(&mut self, _option: SessionOption) -> Result<()> {
            Ok(())
        }
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }
        fn disconnect(&mut self) {}
        fn last_error(&self) -> String {
            "scripted".into()
        }
        fn server_public_key(&mut self) -> Result<Key> {
            Key::from_public_base64(RSA_PUB)
        }
        fn auth_none(&mut self) -> AuthStep {
            if self.fail_none {
                AuthStep::Failed
            } else if self.none_accepted {
                AuthStep::Success
            } else {
                AuthStep::Denied
            }
        }
        fn auth_methods(&mut self) -> Vec<AuthType> {
            self.methods.clone()
        }
        fn auth_password(&mut self, password: &str) -> AuthStep {
            match &self.password {
                Some(p) if p == password => AuthStep::Success,
                _ => AuthStep::Denied,
            }
        }
        fn import_private_key(
            &mut self,
            _material: &str,
            _passphrase: Option<&str>,
        ) -> Result<()> {
            Err(Error::BadKey)
        }
        fn auth_loaded_key(&mut self) -> AuthStep {
            AuthStep::Denied
        }
        fn auth_agent(&mut self, _user: &str) -> AuthStep {
            AuthStep::Denied
        }
        fn kbdint_step(&mut self) -> AuthStep {
            AuthStep::Denied
        }
        fn kbdint_name(&mut self) -> String {
            String::new()
        }
        fn kbdint_instruction(&mut self) -> String {
            String::new()
        }
        fn kbdint_prompts(&mut self) -> Vec<Prompt> {
            Vec::new()
        }
        fn kbdint_answer(&mut self, _index: usize, _answer: &str) -> Result<()> {
            Ok(())
        }
        fn channel_open_session(&mut self) -> Result<()> {
            Ok(())
        }
        fn channel_request_pty(&mut self) -> Result<()> {
            Ok(())
        }
        fn channel_exec(&mut self, _command: &str) -> Result<()> {
            Ok(())
        }
        fn channel_read(&mut self, buf: &mut [u8], stderr: bool) -> Result<usize> {
            if stderr {
                return Ok(0);
            }
            let bytes = self.channel_stdout.as_bytes();
            let n = buf.len().min(bytes.len() - self.read_pos);
            buf[..n].copy_from_slice(&bytes[self.read_pos..self.read_pos + n]);
            self.read_pos += n;
            Ok(n)
        }
        fn channel_close(&mut self) {}
    }

    fn session(engine: ScriptedEngine) -> Session {
        Session::new(Box::new(engine), "example.net", 22, "user").unwrap()
    }

    #[test]
    fn none_success_short_circuits_auth_types() {
        init_test_log();
        let mut s = session(ScriptedEngine {
            none_accepted: true,
            methods: vec![AuthType::Password],
            ..Default::default()
        });
        assert_eq!(s.auth_types(), vec![AuthType::None]);
    }

    #[test]
    fn advertised_methods_pass_through() {
        init_test_log();
        let mut s = session(ScriptedEngine {
            methods: vec![AuthType::PublicKey, AuthType::Interactive],
            ..Default::default()
        });
        assert_eq!(s.auth_types(), vec![AuthType::PublicKey, AuthType::Interactive]);
    }

    #[test]
    fn none_error_yields_empty_list() {
        init_test_log();
        let mut s = session(ScriptedEngine { fail_none: true, ..Default::default() });
        assert!(s.auth_types().is_empty());
    }

    #[test]
    fn password_auth_round_trip() {
        init_test_log();
        let mut s = session(ScriptedEngine {
            password: Some("hunter2".into()),
            ..Default::default()
        });
        assert!(!s.auth_password("wrong"));
        assert!(s.auth_password("hunter2"));
    }

    #[test]
    fn unloadable_key_is_bad_key() {
        init_test_log();
        let mut s = session(ScriptedEngine::default());
        assert_eq!(s.auth_publickey("material", None), PubkeyAuth::BadKey);
    }

    #[test]
    fn server_key_is_cached() {
        init_test_log();
        let mut s = session(ScriptedEngine::default());
        let a = s.server_public_key().unwrap().clone();
        let b = s.server_public_key().unwrap().clone();
        assert_eq!(a, b);
    }
}
