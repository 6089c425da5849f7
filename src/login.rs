//! The SSH bootstrap conversation that starts a Mosh session.
//!
//! Runs on the worker thread and is linear: resolve the host (addresses
//! and SSHFP records concurrently), open the session, check the host key,
//! authenticate, then run the configured `mosh-server` command and parse
//! its reply for the UDP port and shared key. The first failure ends the
//! attempt. All user conversation goes through the facade's descriptors 0
//! and 1/2, like every other I/O in the worker.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::mpsc;

use zeroize::{Zeroize, Zeroizing};

use crate::host::{KnownHosts, SshEngineFactory};
use crate::posix::Posix;
use crate::resolver::{Authenticity, QueryType, Resolver, ResolveStatus};
use crate::ssh::{AuthType, KbdStatus, PubkeyAuth, Session};
use crate::sshfp::{RecordSet, Validity};

const RETRIES: usize = 3;
const INPUT_MAX: usize = 256;

pub const SERVER_COMMAND_DEFAULT: &str =
    "mosh-server new -s -c 256 -l LANG=en_US.UTF-8";

/// Client-side authentication preference. The intersection with what the
/// server advertises keeps this order.
const CLIENT_AUTH_ORDER: [AuthType; 3] =
    [AuthType::PublicKey, AuthType::Interactive, AuthType::Password];

/// State for one bootstrap attempt. The configured fields are filled in by
/// the client instance; the `mosh_*` results are valid after
/// [`start`](SshLogin::start) returns `Ok`.
#[derive(Default)]
pub struct SshLogin {
    pub use_agent: bool,
    pub trust_sshfp: bool,
    pub host: String,
    pub qtype: QueryType,
    pub port: String,
    pub user: String,
    /// PEM private key material from the embedder.
    pub key: Zeroizing<String>,
    pub server_command: String,
    pub remote_command: String,
    pub known_hosts: KnownHosts,

    pub(crate) resolved_addr: String,
    pub(crate) resolved_fp: Vec<String>,

    pub(crate) mosh_port: String,
    pub(crate) mosh_key: Zeroizing<String>,
    pub(crate) mosh_addr: String,
}

impl SshLogin {
    pub fn mosh_addr(&self) -> &str {
        &self.mosh_addr
    }

    pub fn mosh_port(&self) -> &str {
        &self.mosh_port
    }

    pub fn mosh_key(&self) -> &str {
        &self.mosh_key
    }

    pub fn known_hosts(&self) -> &KnownHosts {
        &self.known_hosts
    }

    /// Runs the whole bootstrap. On success the `mosh_*` accessors carry
    /// the negotiated parameters; the key material field is cleared either
    /// way.
    pub fn start(
        &mut self,
        posix: &Posix,
        resolver: &dyn Resolver,
        engines: &dyn SshEngineFactory,
    ) -> Result<()> {
        let result = self.run(posix, resolver, engines);
        // The private key is not needed past one attempt.
        self.key.zeroize();
        result
    }

    fn run(
        &mut self,
        posix: &Posix,
        resolver: &dyn Resolver,
        engines: &dyn SshEngineFactory,
    ) -> Result<()> {
        self.resolve(posix, resolver)?;

        let port: u16 = self
            .port
            .parse()
            .map_err(|_| Error::BadConfig { msg: "bad port" })?;
        let mut session =
            Session::new(engines.open(), &self.resolved_addr, port, &self.user)?;
        if let Err(e) = session.connect() {
            error_line(
                posix,
                &format!("Could not connect via ssh: {}", session.last_error()),
            );
            return Err(e);
        }

        self.check_fingerprint(posix, &mut session)?;

        let auths = self.supported_auths(posix, &mut session)?;
        let mut authenticated = auths.contains(&AuthType::None);
        for auth in &auths {
            if authenticated {
                break;
            }
            display(
                posix,
                &format!("Trying authentication type {}\r\n", auth.name()),
            );
            authenticated = match auth {
                AuthType::Password => self.do_password_auth(posix, &mut session),
                AuthType::Interactive => {
                    self.do_interactive_auth(posix, &mut session)
                }
                AuthType::PublicKey => self.do_public_key_auth(posix, &mut session),
                _ => return Err(Error::bug()),
            };
        }

        if !authenticated {
            error_line(
                posix,
                &format!("ssh authentication failed: {}", session.last_error()),
            );
            return Err(Error::AuthFailed);
        }

        self.do_conversation(posix, &mut session)
    }

    /// Launches the address and SSHFP queries concurrently and joins on
    /// both. SSHFP results whose resolution path is not authentic are
    /// discarded.
    fn resolve(&mut self, posix: &Posix, resolver: &dyn Resolver) -> Result<()> {
        let (addr_tx, addr_rx) = mpsc::channel();
        resolver.resolve(
            self.host.clone(),
            self.qtype,
            Box::new(move |status, authenticity, results| {
                let _ = addr_tx.send((status, authenticity, results));
            }),
        );

        let (fp_tx, fp_rx) = mpsc::channel();
        resolver.resolve(
            self.host.clone(),
            QueryType::Sshfp,
            Box::new(move |status, authenticity, results| {
                let _ = fp_tx.send((status, authenticity, results));
            }),
        );

        // The callback guard makes each sender fire exactly once.
        let (addr_status, addr_auth, mut addr_results) =
            addr_rx.recv().map_err(|_| Error::bug())?;
        let (fp_status, fp_auth, fp_results) =
            fp_rx.recv().map_err(|_| Error::bug())?;

        match addr_auth {
            Authenticity::Authentic => {
                display(posix, "Authenticated DNS lookup.\r\n")
            }
            Authenticity::Insecure => {
                display(posix, "Could NOT authenticate DNS lookup.\r\n")
            }
        }

        match addr_status {
            ResolveStatus::Ok => {}
            ResolveStatus::NotResolved => {
                error_line(
                    posix,
                    "Could not resolve the hostname. \
                     Check the spelling and the address family.",
                );
                return Err(Error::NotResolved);
            }
            other => {
                error_line(
                    posix,
                    &format!(
                        "Name resolution failed with unexpected error code: {other:?}"
                    ),
                );
                return Err(Error::NotResolved);
            }
        }
        if addr_results.is_empty() {
            error_line(posix, "There were no addresses.");
            return Err(Error::NotResolved);
        }
        // Only the first address is used.
        self.resolved_addr = addr_results.swap_remove(0);

        self.resolved_fp =
            if fp_status == ResolveStatus::Ok { fp_results } else { Vec::new() };
        if !self.resolved_fp.is_empty() {
            match fp_auth {
                Authenticity::Authentic => display(
                    posix,
                    "Found authentic SSHFP fingerprint record(s) in DNS.\r\n",
                ),
                Authenticity::Insecure => {
                    display(
                        posix,
                        "Unauthenticated SSHFP fingerprint record(s) in DNS; \
                         ignoring.\r\n",
                    );
                    self.resolved_fp.clear();
                }
            }
        }
        Ok(())
    }

    /// Validates the server key, first against SSHFP records, then against
    /// the synchronized fingerprint dictionary.
    fn check_fingerprint(
        &mut self,
        posix: &Posix,
        session: &mut Session,
    ) -> Result<()> {
        let server_name = host_port_name(&self.host, &self.port);
        display(
            posix,
            &format!("Remote ssh host name/address:\r\n  {server_name}\r\n"),
        );

        // TODO: retire the address-keyed lookup below; fingerprints have
        // been stored by hostname for long enough now.
        let legacy_server_name = host_port_name(&self.resolved_addr, &self.port);

        let host_key = session.server_public_key()?.clone();

        if !self.resolved_fp.is_empty() {
            let mut sshfp = RecordSet::default();
            if !sshfp.parse(&self.resolved_fp) {
                error_line(posix, "Authenticated SSHFP DNS record(s) are malformed!");
                // Carry on; whatever did parse still validates or not, and
                // the fingerprint database remains as a fallback.
            }
            match sshfp.validate(&host_key) {
                Validity::Valid => {
                    if self.trust_sshfp {
                        return Ok(());
                    }
                }
                Validity::Invalid => {
                    error_line(
                        posix,
                        "Authenticated SSHFP DNS record(s) do not validate the host key!\r\n\
                         Likely man-in-the-middle attack or misconfiguration.\r\n\
                         SSHFP record(s) are:",
                    );
                    for record in &self.resolved_fp {
                        error_line(posix, &format!("  {record}"));
                    }
                    if self.trust_sshfp {
                        return Err(Error::HostKeyRejected);
                    }
                }
                Validity::Insufficient => {
                    debug!("no usable sshfp fingerprint; using the fingerprint database");
                }
            }
        }

        let server_fp = host_key.md5();
        display(
            posix,
            &format!(
                "{} key fingerprint of remote ssh host (MD5):\r\n  {server_fp}\r\n",
                host_key.key_type()
            ),
        );

        match self.known_hosts.get(&server_name).cloned() {
            None => {
                // A hostless embedder stored fingerprints by address once;
                // offer to migrate a matching entry.
                if let Some(legacy) = self.known_hosts.get(&legacy_server_name).cloned()
                {
                    if legacy == server_fp {
                        display(
                            posix,
                            &format!(
                                "Fingerprints are now stored by hostname, but an old matching\r\n\
                                 fingerprint for this host's IP address ({}) was found.\r\n",
                                self.resolved_addr
                            ),
                        );
                        if ask_yes_no(
                            posix,
                            "Would you like to use this fingerprint for this host?",
                        ) {
                            self.known_hosts.insert(server_name, legacy);
                            return Ok(());
                        }
                    }
                }

                if ask_yes_no(posix, "Server fingerprint unknown. Store and continue?")
                {
                    self.known_hosts.insert(server_name, server_fp);
                    return Ok(());
                }
            }
            Some(stored) if stored == server_fp => return Ok(()),
            Some(stored) => {
                display(
                    posix,
                    &format!(
                        "WARNING!!! Server fingerprint differs for this host! \
                         Possible man-in-the-middle attack.\r\n\
                         Stored fingerprint (MD5):\r\n  {stored}\r\n"
                    ),
                );
                if ask_yes_no(posix, "Connect anyway, and store new fingerprint?")
                    && ask_yes_no(posix, "Don't take this lightly. Are you really sure?")
                {
                    self.known_hosts.insert(server_name, server_fp);
                    return Ok(());
                }
            }
        }

        Err(Error::HostKeyRejected)
    }

    /// The authentication types both sides support, in client order, after
    /// listing the server's offer for the user.
    fn supported_auths(
        &self,
        posix: &Posix,
        session: &mut Session,
    ) -> Result<Vec<AuthType>> {
        let server_auths = session.auth_types();
        if server_auths.is_empty() {
            error_line(
                posix,
                &format!(
                    "Failed to get authentication types: {}",
                    session.last_error()
                ),
            );
            return Err(Error::AuthFailed);
        }
        if server_auths == [AuthType::None] {
            // The "none" probe already authenticated us.
            return Ok(server_auths);
        }

        display(posix, "Authentication types supported by server:\r\n");
        for auth in &server_auths {
            display(posix, &format!(" - {}", auth.name()));
            if !CLIENT_AUTH_ORDER.contains(auth) {
                display(posix, " (not supported by client)");
            }
            display(posix, "\r\n");
        }

        Ok(CLIENT_AUTH_ORDER
            .iter()
            .filter(|a| server_auths.contains(a))
            .copied()
            .collect())
    }

    fn do_password_auth(&self, posix: &Posix, session: &mut Session) -> bool {
        for tries in (1..=RETRIES).rev() {
            display(posix, "Password: ");
            let input = read_keyboard_line(posix, false);
            display(posix, "\r\n");
            if input.is_empty() {
                // No input: the user is skipping this method.
                return false;
            }
            if session.auth_password(&input) {
                return true;
            }
            if tries == 1 {
                error_line(
                    posix,
                    &format!(
                        "Password authentication failed: {}",
                        session.last_error()
                    ),
                );
            }
        }
        false
    }

    fn do_interactive_auth(&self, posix: &Posix, session: &mut Session) -> bool {
        let mut kbd = session.auth_interactive();
        let mut displayed_instruction = false;
        for tries in (1..=RETRIES).rev() {
            let mut status = kbd.status();
            if !displayed_instruction {
                let instruction = kbd.instruction();
                if !instruction.is_empty() {
                    display(posix, &format!("{}\r\n", format_for_output(&instruction)));
                    // Not repeated when retrying.
                    displayed_instruction = true;
                }
            }
            while status == KbdStatus::Pending {
                let name = kbd.name();
                if !name.is_empty() {
                    display(posix, &format!("{name}\r\n"));
                }
                loop {
                    let prompt = kbd.next_prompt();
                    display(posix, &format_for_output(&prompt.text));
                    let input = read_keyboard_line(posix, prompt.echo);
                    display(posix, "\r\n");
                    if input.is_empty() {
                        // No input: the user is skipping this method.
                        return false;
                    }
                    if kbd.answer(&input) {
                        break;
                    }
                }
                status = kbd.status();
            }
            match status {
                KbdStatus::Authenticated => return true,
                KbdStatus::Partial => {
                    debug!("keyboard-interactive succeeded but is insufficient");
                    return false;
                }
                _ => {
                    if tries == 1 {
                        error_line(posix, "Keyboard interactive auth failed.");
                    }
                }
            }
        }
        false
    }

    fn do_public_key_auth(&self, posix: &Posix, session: &mut Session) -> bool {
        // Agent-held keys come first when enabled.
        if self.use_agent && session.auth_agent() {
            return true;
        }

        for tries in (1..=RETRIES).rev() {
            if self.key.is_empty() {
                display(posix, "No ssh key found.\r\n");
                return false;
            }
            // See whether the key loads without a passphrase first.
            match session.auth_publickey(&self.key, None) {
                PubkeyAuth::Success => return true,
                PubkeyAuth::Denied => {
                    error_line(
                        posix,
                        &format!("Key auth failed: {}", session.last_error()),
                    );
                    return false;
                }
                PubkeyAuth::BadKey => {}
            }

            display(posix, "Passphrase: ");
            let passphrase = read_keyboard_line(posix, false);
            display(posix, "\r\n");
            if passphrase.is_empty() {
                // No input: the user is skipping this method.
                return false;
            }
            match session.auth_publickey(&self.key, Some(&passphrase)) {
                PubkeyAuth::Success => return true,
                PubkeyAuth::Denied => {
                    error_line(
                        posix,
                        &format!("Key auth failed: {}", session.last_error()),
                    );
                    return false;
                }
                PubkeyAuth::BadKey => {
                    if tries == 1 {
                        error_line(
                            posix,
                            "Error reading key. This could be due to the wrong \
                             passphrase, the key type being unsupported, or the key \
                             format being incorrect or corrupt.",
                        );
                    }
                }
            }
        }
        false
    }

    /// Runs the server command over a PTY channel and parses its output.
    fn do_conversation(&mut self, posix: &Posix, session: &mut Session) -> Result<()> {
        let mut command = if self.server_command.is_empty() {
            SERVER_COMMAND_DEFAULT.to_string()
        } else {
            self.server_command.clone()
        };
        if !self.remote_command.is_empty() {
            command.push_str(" -- ");
            command.push_str(&self.remote_command);
        }

        let outcome = {
            let mut channel = session.new_channel();
            match channel.execute(&command) {
                Err(e) => Err(("Failed to execute mosh-server", e)),
                Ok(()) => match channel.read_stdout() {
                    Err(e) => Err(("Error reading from remote ssh server", e)),
                    Ok(reply) => Ok(reply),
                },
            }
        };
        let reply = match outcome {
            Ok(reply) => reply,
            Err((what, e)) => {
                error_line(posix, &format!("{what}: {}", session.last_error()));
                return Err(e);
            }
        };

        self.parse_handshake(posix, &reply)
    }

    /// Scans CRLF-terminated lines of the server reply for the
    /// `MOSH CONNECT <port> <key>` and optional `MOSH IP <addr>` keys.
    fn parse_handshake(&mut self, posix: &Posix, reply: &str) -> Result<()> {
        // Mosh talks to the address we connected to unless the reply says
        // otherwise.
        self.mosh_addr = self.resolved_addr.clone();
        self.mosh_port.clear();
        self.mosh_key = Zeroizing::new(String::new());

        let mut rest = reply;
        while let Some(end) = rest.find("\r\n") {
            let line = &rest[..end];
            rest = &rest[end + 2..];

            if let Some(fields) = line.strip_prefix("MOSH CONNECT ") {
                let mut fields = fields.split_whitespace();
                let (Some(port), Some(key)) = (fields.next(), fields.next()) else {
                    error_line(posix, &format!("Badly formatted MOSH CONNECT line: {line}"));
                    return Err(Error::BadHandshake { msg: line.into() });
                };
                if port.len() > 5 || key.len() > 22 {
                    error_line(posix, &format!("Badly formatted MOSH CONNECT line: {line}"));
                    return Err(Error::BadHandshake { msg: line.into() });
                }
                self.mosh_port = port.into();
                self.mosh_key = Zeroizing::new(key.to_string());
            } else if let Some(fields) = line.strip_prefix("MOSH IP ") {
                let Some(addr) = fields.split_whitespace().next() else {
                    error_line(posix, &format!("Badly formatted MOSH IP line: {line}"));
                    return Err(Error::BadHandshake { msg: line.into() });
                };
                if addr.len() > 63 {
                    error_line(posix, &format!("Badly formatted MOSH IP line: {line}"));
                    return Err(Error::BadHandshake { msg: line.into() });
                }
                self.mosh_addr = addr.into();
            }
        }

        if self.mosh_key.is_empty() || self.mosh_port.is_empty() {
            error_line(
                posix,
                &format!("Bad response when running mosh-server: '{reply}'"),
            );
            return Err(Error::BadHandshake { msg: "missing port or key".into() });
        }
        Ok(())
    }
}

/// `host:port`, with IPv6 hosts bracketed.
fn host_port_name(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn display(posix: &Posix, text: &str) {
    let _ = posix.write(1, text.as_bytes());
}

fn error_line(posix: &Posix, text: &str) {
    let _ = posix.write(2, format!("{text}\r\n").as_bytes());
}

/// Normalizes newlines to CRLF for terminal display.
fn format_for_output(input: &str) -> String {
    input.replace('\n', "\r\n")
}

/// Reads one line of keystrokes through the facade, ending on carriage
/// return, with backspace handling and optional echo. The result buffer is
/// scrubbed on drop.
fn read_keyboard_line(posix: &Posix, echo: bool) -> Zeroizing<String> {
    let mut line = Zeroizing::new(String::new());
    loop {
        let mut byte = [0u8; 1];
        match posix.read(0, &mut byte) {
            Ok(1) => {}
            // Woken with nothing buffered; wait again.
            Ok(_) => continue,
            Err(e) => {
                warn!("keyboard read failed: {e}");
                break;
            }
        }
        match byte[0] {
            b'\r' => break,
            0x08 | 0x7f => {
                if !line.is_empty() {
                    if echo {
                        // '\b' alone does not rub out.
                        let _ = posix.write(1, b"\x08\x1b[K");
                    }
                    line.pop();
                }
            }
            c => {
                if line.len() < INPUT_MAX {
                    if echo {
                        let _ = posix.write(1, &byte);
                    }
                    line.push(c as char);
                }
            }
        }
    }
    line
}

fn ask_yes_no(posix: &Posix, prompt: &str) -> bool {
    for _ in 0..RETRIES {
        display(posix, &format!("{prompt} (Yes/No): "));
        let input = read_keyboard_line(posix, true);
        display(posix, "\r\n");
        match input.as_str() {
            "yes" | "Yes" => return true,
            "no" | "No" => return false,
            _ => display(posix, "Please specify Yes or No.\r\n"),
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moshlog::init_test_log;
    use crate::posix::tests::{InlineMain, NullWriter, ScriptedNet};
    use crate::resolver::Callback;
    use crate::ssh::tests::{ScriptedEngine, RSA_PUB};
    use crate::ssh::{Key, SshEngine};
    use crate::termio::Keyboard;
    use std::sync::{Arc, Mutex};

    /// Facade whose stdin is a scriptable keyboard.
    fn posix_with_keyboard() -> (Posix, Keyboard) {
        let keyboard = Keyboard::new();
        let posix = Posix::new(
            Box::new(ScriptedNet::default()),
            Arc::new(InlineMain),
            Box::new(keyboard.clone()),
            NullWriter::boxed(),
            NullWriter::boxed(),
            None,
        );
        (posix, keyboard)
    }

    /// Resolver answering both query types from canned data.
    struct CannedResolver {
        addr: Vec<String>,
        addr_auth: Authenticity,
        fp: Vec<String>,
        fp_auth: Authenticity,
    }

    impl CannedResolver {
        fn plain(addr: &str) -> CannedResolver {
            CannedResolver {
                addr: vec![addr.into()],
                addr_auth: Authenticity::Insecure,
                fp: Vec::new(),
                fp_auth: Authenticity::Insecure,
            }
        }
    }

    impl Resolver for CannedResolver {
        fn resolve(&self, _name: String, qtype: QueryType, callback: Callback) {
            match qtype {
                QueryType::Sshfp => {
                    if self.fp.is_empty() {
                        callback(
                            ResolveStatus::NotResolved,
                            self.fp_auth,
                            Vec::new(),
                        );
                    } else {
                        callback(ResolveStatus::Ok, self.fp_auth, self.fp.clone());
                    }
                }
                _ => callback(ResolveStatus::Ok, self.addr_auth, self.addr.clone()),
            }
        }

        fn is_validating(&self) -> bool {
            true
        }
    }

    struct Engines(Mutex<Option<ScriptedEngine>>);

    impl Engines {
        fn scripted(engine: ScriptedEngine) -> Engines {
            Engines(Mutex::new(Some(engine)))
        }
    }

    impl SshEngineFactory for Engines {
        fn open(&self) -> Box<dyn SshEngine> {
            Box::new(self.0.lock().unwrap().take().expect("one session per test"))
        }
    }

    fn rsa_md5() -> String {
        Key::from_public_base64(RSA_PUB).unwrap().md5()
    }

    #[test]
    fn handshake_reply_parses() {
        init_test_log();
        let (posix, _kb) = posix_with_keyboard();
        let mut login = SshLogin {
            resolved_addr: "203.0.113.1".into(),
            ..Default::default()
        };
        login
            .parse_handshake(
                &posix,
                "\r\nMOSH IP 10.0.0.1\r\nMOSH CONNECT 60001 ABCDEFGHIJKLMNOPQRSTUV\r\n",
            )
            .unwrap();
        assert_eq!(login.mosh_addr(), "10.0.0.1");
        assert_eq!(login.mosh_port(), "60001");
        assert_eq!(login.mosh_key(), "ABCDEFGHIJKLMNOPQRSTUV");
    }

    #[test]
    fn handshake_defaults_to_connected_address() {
        init_test_log();
        let (posix, _kb) = posix_with_keyboard();
        let mut login = SshLogin {
            resolved_addr: "203.0.113.1".into(),
            ..Default::default()
        };
        login
            .parse_handshake(&posix, "MOSH CONNECT 60001 ABCDEF\r\n")
            .unwrap();
        assert_eq!(login.mosh_addr(), "203.0.113.1");
    }

    #[test]
    fn handshake_requires_connect_line() {
        init_test_log();
        let (posix, _kb) = posix_with_keyboard();
        let mut login = SshLogin::default();
        assert!(login
            .parse_handshake(&posix, "some banner\r\nwith no keys\r\n")
            .is_err());
        // An unterminated CONNECT line does not count.
        assert!(login
            .parse_handshake(&posix, "MOSH CONNECT 60001 ABCDEF")
            .is_err());
    }

    #[test]
    fn handshake_rejects_oversize_fields() {
        init_test_log();
        let (posix, _kb) = posix_with_keyboard();
        let mut login = SshLogin::default();
        assert!(login
            .parse_handshake(&posix, "MOSH CONNECT 600012 ABCDEF\r\n")
            .is_err());
        assert!(login
            .parse_handshake(&posix, "MOSH CONNECT 60001\r\n")
            .is_err());
    }

    #[test]
    fn auth_order_intersection_keeps_client_order() {
        init_test_log();
        let (posix, _kb) = posix_with_keyboard();
        let login = SshLogin::default();
        let mut session = Session::new(
            Box::new(ScriptedEngine {
                methods: vec![
                    AuthType::Password,
                    AuthType::HostBased,
                    AuthType::PublicKey,
                ],
                ..Default::default()
            }),
            "example.net",
            22,
            "user",
        )
        .unwrap();
        let auths = login.supported_auths(&posix, &mut session).unwrap();
        assert_eq!(auths, vec![AuthType::PublicKey, AuthType::Password]);
    }

    #[test]
    fn keyboard_line_editing() {
        init_test_log();
        let (posix, kb) = posix_with_keyboard();
        kb.handle_input("secrex\x7ft\r");
        let line = read_keyboard_line(&posix, false);
        assert_eq!(line.as_str(), "secret");
    }

    #[test]
    fn yes_no_retries_on_nonsense() {
        init_test_log();
        let (posix, kb) = posix_with_keyboard();
        kb.handle_input("maybe\rYes\r");
        assert!(ask_yes_no(&posix, "Continue?"));
        kb.handle_input("no\r");
        assert!(!ask_yes_no(&posix, "Continue?"));
    }

    #[test]
    fn known_host_match_is_silent() {
        init_test_log();
        let (posix, _kb) = posix_with_keyboard();
        let mut login = SshLogin {
            host: "mosh.example.org".into(),
            port: "22".into(),
            resolved_addr: "203.0.113.7".into(),
            ..Default::default()
        };
        login.known_hosts.insert("mosh.example.org:22".into(), rsa_md5());
        let mut session =
            Session::new(Box::new(ScriptedEngine::default()), "h", 22, "u").unwrap();
        login.check_fingerprint(&posix, &mut session).unwrap();
    }

    #[test]
    fn changed_fingerprint_needs_two_confirmations() {
        init_test_log();
        let (posix, kb) = posix_with_keyboard();
        let mut login = SshLogin {
            host: "mosh.example.org".into(),
            port: "22".into(),
            resolved_addr: "203.0.113.7".into(),
            ..Default::default()
        };
        login
            .known_hosts
            .insert("mosh.example.org:22".into(), "00:11:22".into());
        kb.handle_input("Yes\rYes\r");
        let mut session =
            Session::new(Box::new(ScriptedEngine::default()), "h", 22, "u").unwrap();
        login.check_fingerprint(&posix, &mut session).unwrap();
        assert_eq!(login.known_hosts["mosh.example.org:22"], rsa_md5());
    }

    #[test]
    fn legacy_entry_migrates_with_consent() {
        init_test_log();
        let (posix, kb) = posix_with_keyboard();
        let mut login = SshLogin {
            host: "mosh.example.org".into(),
            port: "22".into(),
            resolved_addr: "203.0.113.7".into(),
            ..Default::default()
        };
        login.known_hosts.insert("203.0.113.7:22".into(), rsa_md5());
        kb.handle_input("Yes\r");
        let mut session =
            Session::new(Box::new(ScriptedEngine::default()), "h", 22, "u").unwrap();
        login.check_fingerprint(&posix, &mut session).unwrap();
        assert_eq!(login.known_hosts["mosh.example.org:22"], rsa_md5());
        // The legacy entry stays; only the user may clean it up.
        assert!(login.known_hosts.contains_key("203.0.113.7:22"));
    }

    #[test]
    fn unknown_host_rejected_without_consent() {
        init_test_log();
        let (posix, kb) = posix_with_keyboard();
        let mut login = SshLogin {
            host: "mosh.example.org".into(),
            port: "22".into(),
            resolved_addr: "203.0.113.7".into(),
            ..Default::default()
        };
        kb.handle_input("No\r");
        let mut session =
            Session::new(Box::new(ScriptedEngine::default()), "h", 22, "u").unwrap();
        assert!(login.check_fingerprint(&posix, &mut session).is_err());
        assert!(login.known_hosts.is_empty());
    }

    #[test]
    fn valid_sshfp_with_trust_skips_the_dictionary() {
        init_test_log();
        let (posix, _kb) = posix_with_keyboard();
        let mut login = SshLogin {
            host: "mosh.example.org".into(),
            port: "22".into(),
            resolved_addr: "203.0.113.7".into(),
            trust_sshfp: true,
            resolved_fp: vec![
                "1 1 1B9F53A938596DF02086CC972850D50B7C65F645".into()
            ],
            ..Default::default()
        };
        // No dictionary entry and no keyboard input: only the SSHFP
        // acceptance path can succeed.
        let mut session =
            Session::new(Box::new(ScriptedEngine::default()), "h", 22, "u").unwrap();
        login.check_fingerprint(&posix, &mut session).unwrap();
    }

    #[test]
    fn invalid_sshfp_with_trust_fails() {
        init_test_log();
        let (posix, _kb) = posix_with_keyboard();
        let mut login = SshLogin {
            host: "mosh.example.org".into(),
            port: "22".into(),
            resolved_addr: "203.0.113.7".into(),
            trust_sshfp: true,
            resolved_fp: vec![
                "1 1 0B9F53A938596DF02086CC972850D50B7C65F645".into()
            ],
            ..Default::default()
        };
        let mut session =
            Session::new(Box::new(ScriptedEngine::default()), "h", 22, "u").unwrap();
        assert!(login.check_fingerprint(&posix, &mut session).is_err());
    }

    #[test]
    fn full_bootstrap_with_password() {
        init_test_log();
        let (posix, kb) = posix_with_keyboard();
        let mut login = SshLogin {
            host: "mosh.example.org".into(),
            port: "22".into(),
            user: "mobile".into(),
            ..Default::default()
        };
        login.known_hosts.insert("mosh.example.org:22".into(), rsa_md5());
        login.key = Zeroizing::new("irrelevant".into());

        let resolver = CannedResolver::plain("203.0.113.7");
        let engines = Engines::scripted(ScriptedEngine {
            methods: vec![AuthType::Password],
            password: Some("sesame".into()),
            channel_stdout:
                "\r\nMOSH IP 10.9.8.7\r\nMOSH CONNECT 60001 ABCDEFGHIJKLMNOPQRSTUV\r\n"
                    .into(),
            ..Default::default()
        });
        kb.handle_input("sesame\r");

        login.start(&posix, &resolver, &engines).unwrap();
        assert_eq!(login.mosh_addr(), "10.9.8.7");
        assert_eq!(login.mosh_port(), "60001");
        assert_eq!(login.mosh_key(), "ABCDEFGHIJKLMNOPQRSTUV");
        // Key material is scrubbed after the attempt.
        assert!(login.key.is_empty());
    }

    #[test]
    fn wrong_password_exhausts_retries() {
        init_test_log();
        let (posix, kb) = posix_with_keyboard();
        let mut login = SshLogin {
            host: "mosh.example.org".into(),
            port: "22".into(),
            user: "mobile".into(),
            ..Default::default()
        };
        login.known_hosts.insert("mosh.example.org:22".into(), rsa_md5());

        let resolver = CannedResolver::plain("203.0.113.7");
        let engines = Engines::scripted(ScriptedEngine {
            methods: vec![AuthType::Password],
            password: Some("sesame".into()),
            ..Default::default()
        });
        kb.handle_input("a\rb\rc\r");
        assert!(matches!(
            login.start(&posix, &resolver, &engines),
            Err(Error::AuthFailed)
        ));
    }

    #[test]
    fn none_success_skips_the_auth_loop() {
        init_test_log();
        let (posix, _kb) = posix_with_keyboard();
        let mut login = SshLogin {
            host: "mosh.example.org".into(),
            port: "22".into(),
            user: "mobile".into(),
            ..Default::default()
        };
        login.known_hosts.insert("mosh.example.org:22".into(), rsa_md5());
        let resolver = CannedResolver::plain("203.0.113.7");
        let engines = Engines::scripted(ScriptedEngine {
            none_accepted: true,
            channel_stdout: "MOSH CONNECT 60001 KEYKEYKEY\r\n".into(),
            ..Default::default()
        });
        login.start(&posix, &resolver, &engines).unwrap();
        assert_eq!(login.mosh_port(), "60001");
    }

    #[test]
    fn insecure_sshfp_records_are_dropped() {
        init_test_log();
        let (posix, _kb) = posix_with_keyboard();
        let mut login = SshLogin {
            host: "mosh.example.org".into(),
            qtype: QueryType::A,
            port: "22".into(),
            ..Default::default()
        };
        let resolver = CannedResolver {
            addr: vec!["203.0.113.7".into()],
            addr_auth: Authenticity::Authentic,
            fp: vec!["1 1 1B9F53A938596DF02086CC972850D50B7C65F645".into()],
            fp_auth: Authenticity::Insecure,
        };
        login.resolve(&posix, &resolver).unwrap();
        assert!(login.resolved_fp.is_empty());
        assert_eq!(login.resolved_addr, "203.0.113.7");
    }
}
